//! SQLite database handle
//!
//! A single `rusqlite` connection guarded by a `parking_lot::Mutex`. All
//! statements bind values through named parameters; JSON values are
//! converted on the way in and result rows are rebuilt as JSON objects on
//! the way out.

use base64::Engine;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use serde_json::{Number, Value};
use std::time::Duration;
use tracing::{debug, warn};

use tabula_common::config::DatabaseConfig;
use tabula_common::error::{Error, Result};
use tabula_common::types::Row;

/// Named statement parameters, `(":name", value)`
pub type NamedParams = Vec<(String, SqlValue)>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the configured database file (`:memory:` for an in-memory database)
    ///
    /// # Errors
    /// Returns `Error::Database` if the file cannot be opened.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.path)
        }
        .map_err(db_error)?;

        debug!(path = %config.path, "opened database");
        Self::from_connection(conn, config.busy_timeout_ms)
    }

    /// # Errors
    /// Returns `Error::Database` if the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::from_connection(conn, DatabaseConfig::default().busy_timeout_ms)
    }

    fn from_connection(conn: Connection, busy_timeout_ms: u64) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(db_error)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// # Errors
    /// Returns `Error::Database` if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql).map_err(db_error)
    }

    /// # Errors
    /// Returns `Error::Database` if the statement fails.
    pub fn query_rows(&self, sql: &str, params: &[(String, SqlValue)]) -> Result<Vec<Row>> {
        query_rows(&self.conn.lock(), sql, params)
    }

    /// # Errors
    /// Returns `Error::Database` if the statement fails.
    pub fn query_scalar(&self, sql: &str, params: &[(String, SqlValue)]) -> Result<i64> {
        query_scalar(&self.conn.lock(), sql, params)
    }

    /// Execute a statement, returning the number of changed rows
    ///
    /// # Errors
    /// Returns `Error::Database` if the statement fails.
    pub fn execute(&self, sql: &str, params: &[(String, SqlValue)]) -> Result<usize> {
        execute(&self.conn.lock(), sql, params)
    }

    /// Run `f` with exclusive access to the connection
    ///
    /// # Errors
    /// Propagates the error returned by `f`.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&*self.conn.lock())
    }

    /// Run `f` inside a transaction; any error rolls the whole transaction back
    ///
    /// # Errors
    /// Propagates the error returned by `f`, or `Error::Database` if the
    /// transaction cannot be started or committed.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_error)?;

        match f(&*tx) {
            Ok(value) => {
                tx.commit().map_err(db_error)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!("rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Run a query and collect every row as a JSON object
///
/// # Errors
/// Returns `Error::Database` if the statement fails.
pub fn query_rows(conn: &Connection, sql: &str, params: &[(String, SqlValue)]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).map_err(db_error)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let bound = bind(params);

    let rows = stmt
        .query_map(bound.as_slice(), |row| row_to_json(row, &names))
        .map_err(db_error)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
}

/// Run a query returning a single integer (e.g. `COUNT(*)`)
///
/// # Errors
/// Returns `Error::Database` if the statement fails.
pub fn query_scalar(conn: &Connection, sql: &str, params: &[(String, SqlValue)]) -> Result<i64> {
    let bound = bind(params);
    conn.query_row(sql, bound.as_slice(), |row| row.get(0))
        .map_err(db_error)
}

/// # Errors
/// Returns `Error::Database` if the statement fails.
pub fn execute(conn: &Connection, sql: &str, params: &[(String, SqlValue)]) -> Result<usize> {
    let bound = bind(params);
    conn.execute(sql, bound.as_slice()).map_err(db_error)
}

fn bind(params: &[(String, SqlValue)]) -> Vec<(&str, &dyn ToSql)> {
    params
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect()
}

/// Convert a JSON value into a bindable SQLite value
///
/// Booleans become 0/1; arrays and objects are stored as JSON text.
#[must_use]
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn row_to_json(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<Row> {
    let mut object = Row::new();
    for (idx, name) in names.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        };
        object.insert(name.clone(), value);
    }
    Ok(object)
}

/// Map a driver error into the shared taxonomy
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn db_error(err: rusqlite::Error) -> Error {
    Error::Database(err.to_string())
}

/// Quote an identifier for interpolation into SQL
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, data BLOB, flag INTEGER);",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_json_round_trip_through_sqlite() {
        let db = db();
        let params = vec![
            (":name".to_string(), json_to_sql(&json!("widget"))),
            (":price".to_string(), json_to_sql(&json!(9.5))),
            (":flag".to_string(), json_to_sql(&json!(true))),
        ];
        let changed = db
            .execute(
                "INSERT INTO items (name, price, flag, data) VALUES (:name, :price, :flag, x'0102')",
                &params,
            )
            .unwrap();
        assert_eq!(changed, 1);

        let rows = db.query_rows("SELECT * FROM items", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["name"], "widget");
        assert_eq!(rows[0]["price"], 9.5);
        assert_eq!(rows[0]["flag"], 1);
        assert_eq!(rows[0]["data"], "AQI=");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = db();
        let result: Result<()> = db.transaction(|tx| {
            execute(tx, "INSERT INTO items (name) VALUES ('a')", &[])?;
            Err(Error::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.query_scalar("SELECT COUNT(*) FROM items", &[]).unwrap(), 0);

        db.transaction(|tx| execute(tx, "INSERT INTO items (name) VALUES ('b')", &[]))
            .unwrap();
        assert_eq!(db.query_scalar("SELECT COUNT(*) FROM items", &[]).unwrap(), 1);
    }

    #[test]
    fn test_nested_values_stored_as_json_text() {
        assert_eq!(
            json_to_sql(&json!({"a": [1, 2]})),
            SqlValue::Text("{\"a\":[1,2]}".to_string())
        );
        assert_eq!(json_to_sql(&Value::Null), SqlValue::Null);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
