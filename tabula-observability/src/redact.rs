//! Sensitive-field redaction

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Marker written in place of sensitive values
pub const REDACTED: &str = "***REDACTED***";

/// Replaces values of sensitive keys, recursively
#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Redactor {
    #[must_use]
    pub fn new(keys: &[String]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_ascii_lowercase()).collect(),
        }
    }

    /// Case-insensitive substring match against the sensitive key list
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    #[must_use]
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive(k) {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    /// Redact a flat string map such as headers or query parameters
    #[must_use]
    pub fn redact_map(&self, map: &HashMap<String, String>) -> Value {
        let object: Map<String, Value> = map
            .iter()
            .map(|(k, v)| {
                let v = if self.is_sensitive(k) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), Value::String(v))
            })
            .collect();
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn redactor() -> Redactor {
        Redactor::new(&["password".to_string(), "token".to_string(), "API_KEY".to_string()])
    }

    #[test]
    fn test_nested_redaction() {
        let body = json!({
            "username": "alice",
            "password": "x",
            "profile": {"refresh_token": "abc", "age": 30},
            "items": [{"user_password": "y"}, 5]
        });
        let redacted = redactor().redact(&body);

        assert_eq!(redacted["username"], "alice");
        assert_eq!(redacted["password"], REDACTED);
        assert_eq!(redacted["profile"]["refresh_token"], REDACTED);
        assert_eq!(redacted["profile"]["age"], 30);
        assert_eq!(redacted["items"][0]["user_password"], REDACTED);
        assert_eq!(redacted["items"][1], 5);
    }

    #[test]
    fn test_case_insensitive_keys() {
        let r = redactor();
        assert!(r.is_sensitive("Password"));
        assert!(r.is_sensitive("x-api_key"));
        assert!(!r.is_sensitive("email"));
    }

    #[test]
    fn test_redact_map() {
        let headers = HashMap::from([
            ("authorization-token".to_string(), "Bearer x".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ]);
        let value = redactor().redact_map(&headers);
        assert_eq!(value["authorization-token"], REDACTED);
        assert_eq!(value["accept"], "application/json");
    }
}
