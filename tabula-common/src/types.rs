//! Shared schema and permission types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A result row keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Permission Types
// ============================================================================

/// Table-scoped action checked by the RBAC guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Schema Types
// ============================================================================

/// Column metadata from schema introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub default_value: Option<String>,
    pub is_auto_increment: bool,
}

/// Table metadata: name plus its ordered columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableDescriptor {
    /// Names of every column, the whitelist used by the query compiler
    #[must_use]
    pub fn column_names(&self) -> HashSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check if column exists
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }

    /// First primary key column, if any
    #[must_use]
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Column description in the shape returned by the `columns` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "Field")]
    pub field: String,
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Null")]
    pub null: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Default")]
    pub default: Option<String>,
    #[serde(rename = "Extra")]
    pub extra: String,
}

impl From<&ColumnInfo> for ColumnDescriptor {
    fn from(column: &ColumnInfo) -> Self {
        Self {
            field: column.name.clone(),
            data_type: column.data_type.clone(),
            null: if column.is_nullable { "YES" } else { "NO" }.to_string(),
            key: if column.is_primary_key { "PRI" } else { "" }.to_string(),
            default: column.default_value.clone(),
            extra: if column.is_auto_increment {
                "auto_increment"
            } else {
                ""
            }
            .to_string(),
        }
    }
}
