//! Immutable request and response values threaded through the pipeline

use serde_json::{json, Value};
use std::collections::HashMap;

/// HTTP method of an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    Other,
}

impl Method {
    #[must_use]
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "HEAD" => Self::Head,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request, built once at the transport boundary
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Option<Value>,
    remote_addr: Option<String>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            remote_addr: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Header names are stored lower-cased
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Value of the `action` query parameter
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.param("action")
    }

    /// Query parameter by name, empty values treated as absent
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Header by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Client address: first `X-Forwarded-For` entry, else the peer address
    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.header("x-forwarded-for")
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or(self.remote_addr.as_deref())
    }
}

/// Outbound response: status, JSON body and extra headers
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl ApiResponse {
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self::with_status(200, body)
    }

    #[must_use]
    pub fn created(body: Value) -> Self {
        Self::with_status(201, body)
    }

    #[must_use]
    pub fn with_status(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            headers: vec![],
        }
    }

    /// Error envelope `{"error": message}`
    #[must_use]
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::with_status(status, json!({ "error": message.into() }))
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Header value by case-insensitive name
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialized body length in bytes
    #[must_use]
    pub fn body_size(&self) -> usize {
        serde_json::to_vec(&self.body).map_or(0, |b| b.len())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
