//! Login credentials read from the database

use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::sync::Arc;

use tabula_auth::{CredentialStore, StoredCredential};
use tabula_common::error::{Error, Result};

use crate::db::{quote_ident, Database};
use crate::query::is_safe_identifier;

/// Reads `username, password_hash, role, active` from the credentials table
pub struct SqliteCredentialStore {
    db: Arc<Database>,
    table: String,
}

impl SqliteCredentialStore {
    #[must_use]
    pub fn new(db: Arc<Database>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn find(&self, username: &str) -> Result<Option<StoredCredential>> {
        if !is_safe_identifier(&self.table) {
            return Err(Error::Config(format!(
                "invalid credentials table name '{}'",
                self.table
            )));
        }

        let sql = format!(
            "SELECT username, password_hash, role, active FROM {} WHERE username = :username LIMIT 1",
            quote_ident(&self.table)
        );
        let params = [(":username".to_string(), SqlValue::Text(username.to_string()))];
        let Some(row) = self.db.query_rows(&sql, &params)?.into_iter().next() else {
            return Ok(None);
        };

        let text = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let active = match row.get("active") {
            Some(Value::Number(n)) => n.as_i64() != Some(0),
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !matches!(s.as_str(), "0" | "false" | ""),
            _ => false,
        };

        Ok(Some(StoredCredential {
            username: text("username"),
            password_hash: text("password_hash"),
            role: text("role"),
            active,
        }))
    }
}
