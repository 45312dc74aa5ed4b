//! Schema introspection and caching for the exposed tables

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use tabula_common::error::{Error, Result};
use tabula_common::types::{ColumnDescriptor, ColumnInfo, TableDescriptor};

use crate::db::{query_rows, Database};
use crate::query::is_safe_identifier;

/// Source of table and column metadata
pub trait SchemaInspector: Send + Sync {
    /// # Errors
    /// Returns an error if the catalog cannot be read.
    fn tables(&self) -> Result<Vec<String>>;

    /// # Errors
    /// Returns an error if the catalog cannot be read.
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// # Errors
    /// Returns an error if the catalog cannot be read.
    fn primary_key(&self, table: &str) -> Result<Option<String>> {
        Ok(self
            .columns(table)?
            .into_iter()
            .find(|c| c.is_primary_key)
            .map(|c| c.name))
    }
}

/// Reads the SQLite catalog (`sqlite_master`, `pragma_table_info`)
pub struct SqliteSchemaInspector {
    db: Arc<Database>,
}

impl SqliteSchemaInspector {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl SchemaInspector for SqliteSchemaInspector {
    fn tables(&self) -> Result<Vec<String>> {
        let rows = self.db.query_rows(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self.db.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(:table) ORDER BY cid",
                &[(":table".to_string(), table.to_string().into())],
            )
        })?;

        let pk_count = rows
            .iter()
            .filter(|row| row.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0)
            .count();

        Ok(rows
            .iter()
            .map(|row| {
                let data_type = row
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let is_primary_key = row.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0;
                ColumnInfo {
                    name: row
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    is_nullable: row.get("notnull").and_then(Value::as_i64) == Some(0)
                        && !is_primary_key,
                    default_value: row.get("dflt_value").and_then(|v| match v {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    }),
                    // a lone INTEGER PRIMARY KEY aliases the rowid
                    is_auto_increment: is_primary_key
                        && pk_count == 1
                        && data_type.eq_ignore_ascii_case("INTEGER"),
                    is_primary_key,
                    data_type,
                }
            })
            .collect())
    }
}

/// Process-lifetime cache of the exposed schema
///
/// Hidden tables (the credentials table among them) are invisible to every
/// caller: they are absent from `tables()` and rejected by `table()`.
pub struct SchemaCache {
    inspector: Arc<dyn SchemaInspector>,
    hidden: HashSet<String>,
    tables: RwLock<Option<Vec<String>>>,
    descriptors: RwLock<HashMap<String, Arc<TableDescriptor>>>,
}

impl SchemaCache {
    #[must_use]
    pub fn new(inspector: Arc<dyn SchemaInspector>, hidden: impl IntoIterator<Item = String>) -> Self {
        Self {
            inspector,
            hidden: hidden.into_iter().collect(),
            tables: RwLock::new(None),
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// Names of the exposed tables
    ///
    /// # Errors
    /// Returns an error if the inspector fails on first use.
    pub fn tables(&self) -> Result<Vec<String>> {
        if let Some(tables) = self.tables.read().as_ref() {
            return Ok(tables.clone());
        }

        let tables: Vec<String> = self
            .inspector
            .tables()?
            .into_iter()
            .filter(|t| !self.hidden.contains(t))
            .collect();
        debug!(count = tables.len(), "loaded table list");
        *self.tables.write() = Some(tables.clone());
        Ok(tables)
    }

    /// # Errors
    /// Returns an error if the inspector fails on first use.
    pub fn has_table(&self, name: &str) -> Result<bool> {
        Ok(is_safe_identifier(name) && self.tables()?.iter().any(|t| t == name))
    }

    /// Descriptor for an exposed table
    ///
    /// # Errors
    /// Returns `Error::InvalidTable` for unknown, hidden or unsafe names.
    pub fn table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        if !self.has_table(name)? {
            return Err(Error::InvalidTable(name.to_string()));
        }
        if let Some(descriptor) = self.descriptors.read().get(name) {
            return Ok(Arc::clone(descriptor));
        }

        let descriptor = Arc::new(TableDescriptor {
            name: name.to_string(),
            columns: self.inspector.columns(name)?,
        });
        self.descriptors
            .write()
            .insert(name.to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Column descriptors in the `{Field, Type, Null, Key, Default, Extra}` shape
    ///
    /// # Errors
    /// Returns `Error::InvalidTable` for unknown tables.
    pub fn column_descriptors(&self, name: &str) -> Result<Vec<ColumnDescriptor>> {
        Ok(self
            .table(name)?
            .columns
            .iter()
            .map(ColumnDescriptor::from)
            .collect())
    }

    /// Drop everything cached so the next lookup re-reads the catalog
    pub fn refresh(&self) {
        *self.tables.write() = None;
        self.descriptors.write().clear();
    }

    /// Generate an OpenAPI 3.0.3 document for the exposed tables
    ///
    /// # Errors
    /// Returns an error if the schema cannot be read.
    pub fn generate_openapi(&self, title: &str) -> Result<Value> {
        let mut schemas = Map::new();
        for name in self.tables()? {
            let table = self.table(&name)?;
            schemas.insert(name, table_to_json_schema(&table));
        }
        let table_names: Vec<Value> = schemas.keys().map(|k| Value::String(k.clone())).collect();

        let table_param = json!({
            "name": "table", "in": "query", "required": true,
            "schema": {"type": "string", "enum": table_names}
        });
        let id_param = json!({"name": "id", "in": "query", "required": true, "schema": {"type": "string"}});
        let list_params = json!([
            table_param,
            {"name": "filter", "in": "query", "schema": {"type": "string"},
             "description": "Comma-separated col:op:value clauses"},
            {"name": "sort", "in": "query", "schema": {"type": "string"},
             "description": "Comma-separated col:asc|desc, -col or col"},
            {"name": "fields", "in": "query", "schema": {"type": "string"}},
            {"name": "page", "in": "query", "schema": {"type": "integer", "minimum": 1}},
            {"name": "page_size", "in": "query", "schema": {"type": "integer", "minimum": 1, "maximum": 100}}
        ]);

        let operation = |action: &str, summary: &str, params: Value, body: Option<Value>| {
            let mut op = json!({
                "summary": summary,
                "operationId": action,
                "parameters": [{"name": "action", "in": "query", "required": true,
                                "schema": {"type": "string", "enum": [action]}}],
                "responses": {
                    "200": {"description": "OK"},
                    "400": {"description": "Validation error"},
                    "401": {"description": "Authentication required"},
                    "403": {"description": "Forbidden"},
                    "429": {"description": "Rate limit exceeded"}
                }
            });
            if let (Some(list), Value::Array(extra)) = (op["parameters"].as_array_mut(), params) {
                list.extend(extra);
            }
            if let Some(body) = body {
                op["requestBody"] = json!({"required": true, "content": {"application/json": {"schema": body}}});
            }
            op
        };

        let any_row = json!({"type": "object"});
        let paths = json!({
            "/api?action=tables": {"get": operation("tables", "List tables", json!([]), None)},
            "/api?action=columns": {"get": operation("columns", "Describe table columns", json!([table_param]), None)},
            "/api?action=list": {"get": operation("list", "List rows", list_params.clone(), None)},
            "/api?action=count": {"get": operation("count", "Count rows", list_params, None)},
            "/api?action=read": {"get": operation("read", "Read one row", json!([table_param, id_param]), None)},
            "/api?action=create": {"post": operation("create", "Create a row", json!([table_param]), Some(any_row.clone()))},
            "/api?action=update": {"put": operation("update", "Update a row", json!([table_param, id_param]), Some(any_row.clone()))},
            "/api?action=delete": {"delete": operation("delete", "Delete a row", json!([table_param, id_param]), None)},
            "/api?action=bulk_create": {"post": operation("bulk_create", "Create rows atomically", json!([table_param]),
                Some(json!({"type": "array", "items": any_row})))},
            "/api?action=bulk_delete": {"post": operation("bulk_delete", "Delete rows by id", json!([table_param]),
                Some(json!({"type": "object", "properties": {"ids": {"type": "array"}}, "required": ["ids"]})))},
            "/api?action=login": {"post": operation("login", "Exchange credentials for a token", json!([]),
                Some(json!({"type": "object", "properties": {"username": {"type": "string"}, "password": {"type": "string"}}})))},
        });

        Ok(json!({
            "openapi": "3.0.3",
            "info": {
                "title": title,
                "version": env!("CARGO_PKG_VERSION"),
                "description": "Auto-generated CRUD API from database schema"
            },
            "paths": paths,
            "components": {
                "schemas": schemas,
                "securitySchemes": {
                    "bearerAuth": {"type": "http", "scheme": "bearer", "bearerFormat": "JWT"},
                    "apiKeyAuth": {"type": "apiKey", "in": "header", "name": "X-API-Key"}
                }
            }
        }))
    }
}

fn table_to_json_schema(table: &TableDescriptor) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for column in &table.columns {
        properties.insert(column.name.clone(), column_to_json_schema(column));
        if !column.is_nullable && column.default_value.is_none() && !column.is_auto_increment {
            required.push(Value::String(column.name.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Map a declared SQLite type onto a JSON schema type using affinity rules
fn column_to_json_schema(column: &ColumnInfo) -> Value {
    let declared = column.data_type.to_ascii_uppercase();
    let json_type = if declared.contains("INT") {
        "integer"
    } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
        .iter()
        .any(|t| declared.contains(t))
    {
        "number"
    } else if declared.contains("BOOL") {
        "boolean"
    } else {
        "string"
    };

    let mut schema = json!({"type": json_type});
    if declared.contains("TIMESTAMP") || declared.contains("DATETIME") {
        schema["format"] = Value::String("date-time".to_string());
    } else if declared == "DATE" {
        schema["format"] = Value::String("date".to_string());
    } else if declared.contains("BLOB") {
        schema["format"] = Value::String("byte".to_string());
    }
    if column.is_nullable {
        schema["nullable"] = Value::Bool(true);
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SchemaCache {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, age INTEGER DEFAULT 0, created_at TIMESTAMP);
             CREATE TABLE api_users (username TEXT PRIMARY KEY, password_hash TEXT, role TEXT, active INTEGER);
             CREATE TABLE tags (name TEXT PRIMARY KEY);",
        )
        .unwrap();
        SchemaCache::new(
            Arc::new(SqliteSchemaInspector::new(db)),
            vec!["api_users".to_string()],
        )
    }

    #[test]
    fn test_tables_hide_credentials() {
        let cache = cache();
        assert_eq!(cache.tables().unwrap(), vec!["tags", "users"]);
        assert!(cache.has_table("users").unwrap());
        assert!(!cache.has_table("api_users").unwrap());
        assert!(matches!(cache.table("api_users"), Err(Error::InvalidTable(_))));
        assert!(matches!(cache.table("users; DROP"), Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_column_metadata() {
        let cache = cache();
        let users = cache.table("users").unwrap();
        assert_eq!(users.primary_key(), Some("id"));

        let id = &users.columns[0];
        assert!(id.is_auto_increment);
        assert!(!id.is_nullable);
        let email = &users.columns[1];
        assert!(!email.is_nullable);
        assert_eq!(users.columns[2].default_value.as_deref(), Some("0"));

        let tags = cache.table("tags").unwrap();
        assert!(!tags.columns[0].is_auto_increment);
    }

    #[test]
    fn test_column_descriptor_shape() {
        let cache = cache();
        let columns = serde_json::to_value(cache.column_descriptors("users").unwrap()).unwrap();
        assert_eq!(columns[0]["Field"], "id");
        assert_eq!(columns[0]["Key"], "PRI");
        assert_eq!(columns[0]["Extra"], "auto_increment");
        assert_eq!(columns[1]["Null"], "NO");
        assert_eq!(columns[3]["Null"], "YES");
    }

    #[test]
    fn test_refresh_sees_new_tables() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = SchemaCache::new(Arc::new(SqliteSchemaInspector::new(Arc::clone(&db))), vec![]);
        assert!(cache.tables().unwrap().is_empty());

        db.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY)").unwrap();
        assert!(cache.tables().unwrap().is_empty());
        cache.refresh();
        assert_eq!(cache.tables().unwrap(), vec!["notes"]);
    }

    #[test]
    fn test_openapi_generation() {
        let cache = cache();
        let doc = cache.generate_openapi("tabula").unwrap();
        assert_eq!(doc["openapi"], "3.0.3");
        assert!(doc["components"]["schemas"]["users"].is_object());
        assert!(doc["components"]["schemas"].get("api_users").is_none());
        assert_eq!(
            doc["components"]["schemas"]["users"]["properties"]["created_at"]["format"],
            "date-time"
        );
        assert_eq!(doc["components"]["schemas"]["users"]["required"], json!(["email"]));
        assert!(doc["paths"]["/api?action=list"]["get"].is_object());
    }
}
