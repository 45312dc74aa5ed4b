//! Query executor: CRUD and bulk operations over exposed tables

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use tabula_common::error::{Error, Result};
use tabula_common::types::{Row, TableDescriptor};

use crate::db::{execute, json_to_sql, query_rows, quote_ident, Database, NamedParams};
use crate::query::{compile_filter, compile_sort, order_sql, projection, CompiledFilter, QueryOptions};
use crate::schema::SchemaCache;

/// Upper bound on records per bulk request
pub const MAX_BULK: usize = 1000;

pub struct QueryExecutor {
    db: Arc<Database>,
    schema: Arc<SchemaCache>,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(db: Arc<Database>, schema: Arc<SchemaCache>) -> Self {
        Self { db, schema }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    /// Paginated rows plus `{total, page, page_size, pages}`
    ///
    /// # Errors
    /// Returns `Error::InvalidTable`, `Error::InvalidSort` or a database error.
    pub fn list(&self, table: &str, opts: &QueryOptions) -> Result<Value> {
        let table = self.schema.table(table)?;
        let valid = table.column_names();
        let filter = compile_filter(&valid, opts.filter.as_deref());
        let sort = compile_sort(&valid, opts.sort.as_deref())?;

        let mut sql = format!(
            "SELECT {} FROM {}",
            projection(&table, &opts.fields),
            quote_ident(&table.name)
        );
        if let Some(where_sql) = filter.where_sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        if let Some(order) = order_sql(&sort) {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", opts.page_size, opts.offset()));

        let params = filter_params(&filter);
        let rows = self.db.query_rows(&sql, &params)?;
        let total = self.count_matching(&table, &filter)?;
        let pages = total.div_ceil(u64::from(opts.page_size));

        debug!(table = %table.name, total, rows = rows.len(), "list");
        Ok(json!({
            "data": rows,
            "meta": {
                "total": total,
                "page": opts.page,
                "page_size": opts.page_size,
                "pages": pages,
            }
        }))
    }

    /// `{count}` of rows matching the filter
    ///
    /// # Errors
    /// Returns `Error::InvalidTable` or a database error.
    pub fn count(&self, table: &str, opts: &QueryOptions) -> Result<Value> {
        let table = self.schema.table(table)?;
        let filter = compile_filter(&table.column_names(), opts.filter.as_deref());
        Ok(json!({ "count": self.count_matching(&table, &filter)? }))
    }

    fn count_matching(&self, table: &TableDescriptor, filter: &CompiledFilter) -> Result<u64> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table.name));
        if let Some(where_sql) = filter.where_sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        let total = self.db.query_scalar(&sql, &filter_params(filter))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// Single row by primary key
    ///
    /// # Errors
    /// Returns `Error::InvalidTable`, a validation error for tables without a
    /// primary key, or a database error.
    pub fn read(&self, table: &str, id: &Value) -> Result<Option<Row>> {
        let table = self.schema.table(table)?;
        self.db.with_connection(|conn| read_by_pk(conn, &table, id))
    }

    /// Insert one row and return it as stored
    ///
    /// # Errors
    /// Returns a validation error for bad bodies or columns, or a database error.
    pub fn create(&self, table: &str, data: &Value) -> Result<Row> {
        let table = self.schema.table(table)?;
        let record = writable_object(&table, data)?;
        self.db.with_connection(|conn| insert_row(conn, &table, record))
    }

    /// Update one row by primary key
    ///
    /// An update matching no row is only an error when the id does not exist;
    /// an unchanged row is returned as is.
    ///
    /// # Errors
    /// Returns `Error::NotFound` for unknown ids, a validation error for bad
    /// bodies, or a database error.
    pub fn update(&self, table: &str, id: &Value, data: &Value) -> Result<Row> {
        let table = self.schema.table(table)?;
        let pk = require_pk(&table)?;
        let record = writable_object(&table, data)?;

        let mut params: NamedParams = Vec::with_capacity(record.len() + 1);
        let assignments: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, (column, value))| {
                let name = format!(":v{i}");
                params.push((name.clone(), json_to_sql(value)));
                format!("{} = {name}", quote_ident(column))
            })
            .collect();
        params.push((":id".to_string(), json_to_sql(id)));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = :id",
            quote_ident(&table.name),
            assignments.join(", "),
            quote_ident(pk)
        );

        // a primary key rewritten by this update moves the row
        let lookup = record.get(pk).unwrap_or(id);

        self.db.with_connection(|conn| {
            let changed = execute(conn, &sql, &params)?;
            if changed == 0 {
                debug!(table = %table.name, "update matched no rows");
            }
            read_by_pk(conn, &table, if changed == 0 { id } else { lookup })?
                .ok_or_else(|| Error::NotFound("Record not found".to_string()))
        })
    }

    /// Delete one row by primary key
    ///
    /// # Errors
    /// Returns `Error::NotFound` when no row was deleted.
    pub fn delete(&self, table: &str, id: &Value) -> Result<Value> {
        let table = self.schema.table(table)?;
        let pk = require_pk(&table)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = :id",
            quote_ident(&table.name),
            quote_ident(pk)
        );

        let deleted = self
            .db
            .execute(&sql, &[(":id".to_string(), json_to_sql(id))])?;
        if deleted == 0 {
            return Err(Error::NotFound("Record not found".to_string()));
        }
        Ok(json!({ "success": true }))
    }

    /// Insert every record in one transaction; any failure rolls all back
    ///
    /// # Errors
    /// Returns a validation error for bad bodies and `Error::BulkWriteFailed`
    /// when a row is rejected by the database.
    pub fn bulk_create(&self, table: &str, records: &Value) -> Result<Value> {
        let table = self.schema.table(table)?;
        let records = records
            .as_array()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::Validation("Request body must be a non-empty JSON array".to_string()))?;
        if records.len() > MAX_BULK {
            return Err(Error::Validation(format!(
                "At most {MAX_BULK} records per bulk request"
            )));
        }
        let records = records
            .iter()
            .map(|r| writable_object(&table, r))
            .collect::<Result<Vec<_>>>()?;

        let created = self
            .db
            .transaction(|tx| {
                records
                    .into_iter()
                    .map(|record| insert_row(tx, &table, record))
                    .collect::<Result<Vec<_>>>()
            })
            .map_err(|e| match e {
                Error::Database(msg) => Error::BulkWriteFailed(msg),
                other => other,
            })?;

        Ok(json!({
            "success": true,
            "created": created.len(),
            "data": created,
        }))
    }

    /// Delete by a list of ids, reporting how many rows were removed
    ///
    /// # Errors
    /// Returns a validation error for bad bodies, or a database error.
    pub fn bulk_delete(&self, table: &str, body: &Value) -> Result<Value> {
        let table = self.schema.table(table)?;
        let pk = require_pk(&table)?;
        let ids = body
            .get("ids")
            .and_then(Value::as_array)
            .filter(|ids| !ids.is_empty())
            .ok_or_else(|| Error::Validation("Request body must contain a non-empty \"ids\" array".to_string()))?;
        if ids.len() > MAX_BULK {
            return Err(Error::Validation(format!("At most {MAX_BULK} ids per bulk request")));
        }

        let params: NamedParams = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (format!(":id{i}"), json_to_sql(id)))
            .collect();
        let placeholders: Vec<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(&table.name),
            quote_ident(pk),
            placeholders.join(", ")
        );

        let deleted = self.db.execute(&sql, &params)?;
        Ok(json!({ "success": true, "deleted": deleted }))
    }
}

fn filter_params(filter: &CompiledFilter) -> NamedParams {
    filter
        .params
        .iter()
        .map(|(name, value)| (name.clone(), SqlValue::Text(value.clone())))
        .collect()
}

fn require_pk(table: &TableDescriptor) -> Result<&str> {
    table
        .primary_key()
        .ok_or_else(|| Error::Validation(format!("Table '{}' has no primary key", table.name)))
}

/// Body of a single-row write: a non-empty object naming only real columns
fn writable_object<'a>(table: &TableDescriptor, data: &'a Value) -> Result<&'a Row> {
    let record = data
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::Validation("Request body must be a non-empty JSON object".to_string()))?;

    if let Some(unknown) = record.keys().find(|k| !table.has_column(k)) {
        return Err(Error::InvalidColumn(unknown.clone()));
    }
    Ok(record)
}

fn read_by_pk(conn: &Connection, table: &TableDescriptor, id: &Value) -> Result<Option<Row>> {
    let pk = require_pk(table)?;
    let sql = format!(
        "SELECT * FROM {} WHERE {} = :id LIMIT 1",
        quote_ident(&table.name),
        quote_ident(pk)
    );
    Ok(query_rows(conn, &sql, &[(":id".to_string(), json_to_sql(id))])?
        .into_iter()
        .next())
}

/// Insert `record` and return the stored row, database defaults included
fn insert_row(conn: &Connection, table: &TableDescriptor, record: &Row) -> Result<Row> {
    let columns: Vec<String> = record.keys().map(|c| quote_ident(c)).collect();
    let params: NamedParams = record
        .values()
        .enumerate()
        .map(|(i, value)| (format!(":v{i}"), json_to_sql(value)))
        .collect();
    let placeholders: Vec<&str> = params.iter().map(|(name, _)| name.as_str()).collect();

    // RETURNING works for WITHOUT ROWID tables too
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        quote_ident(&table.name),
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok(query_rows(conn, &sql, &params)?
        .into_iter()
        .next()
        .unwrap_or_else(|| record.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqliteSchemaInspector;

    fn executor() -> QueryExecutor {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.execute_batch(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                age INTEGER,
                status TEXT DEFAULT 'active',
                created_at TEXT
            );
            CREATE TABLE t (id INTEGER PRIMARY KEY, a INTEGER CHECK (typeof(a) = 'integer'));
            CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT DEFAULT 'unset') WITHOUT ROWID;",
        )
        .unwrap();
        let schema = Arc::new(SchemaCache::new(
            Arc::new(SqliteSchemaInspector::new(Arc::clone(&db))),
            vec![],
        ));
        QueryExecutor::new(db, schema)
    }

    fn seed(exec: &QueryExecutor, n: u32) {
        for i in 1..=n {
            exec.create(
                "users",
                &json!({"name": format!("user{i}"), "age": 20 + i, "created_at": format!("2024-01-{i:02}")}),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_create_reflects_defaults() {
        let exec = executor();
        let row = exec.create("users", &json!({"name": "ann", "age": 30})).unwrap();
        assert_eq!(row["id"], 1);
        assert_eq!(row["status"], "active");
    }

    #[test]
    fn test_unknown_column_rejected() {
        let exec = executor();
        let err = exec.create("users", &json!({"nope": 1})).unwrap_err();
        assert!(matches!(err, Error::InvalidColumn(c) if c == "nope"));
        assert!(matches!(
            exec.create("users", &json!([1, 2])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_list_paginates_and_sorts() {
        let exec = executor();
        seed(&exec, 25);
        let opts = QueryOptions {
            sort: Some("-created_at".into()),
            page: 2,
            page_size: 10,
            ..QueryOptions::default()
        };
        let result = exec.list("users", &opts).unwrap();
        let data = result["data"].as_array().unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[0]["name"], "user15");
        assert_eq!(result["meta"], json!({"total": 25, "page": 2, "page_size": 10, "pages": 3}));
    }

    #[test]
    fn test_list_projection_and_filter() {
        let exec = executor();
        seed(&exec, 5);
        let opts = QueryOptions {
            fields: vec!["name".into(), "bogus".into()],
            filter: Some("age:gte:24".into()),
            ..QueryOptions::default()
        };
        let result = exec.list("users", &opts).unwrap();
        let data = result["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].as_object().unwrap().len(), 1);
        assert_eq!(exec.count("users", &opts).unwrap()["count"], 2);
    }

    #[test]
    fn test_invalid_sort_rejected() {
        let exec = executor();
        let opts = QueryOptions {
            sort: Some("password:desc".into()),
            ..QueryOptions::default()
        };
        assert!(matches!(exec.list("users", &opts), Err(Error::InvalidSort(_))));
    }

    #[test]
    fn test_read_update_delete() {
        let exec = executor();
        seed(&exec, 2);

        let row = exec.read("users", &json!("1")).unwrap().unwrap();
        assert_eq!(row["name"], "user1");
        assert!(exec.read("users", &json!(99)).unwrap().is_none());

        let updated = exec.update("users", &json!("1"), &json!({"age": 99})).unwrap();
        assert_eq!(updated["age"], 99);

        // unchanged values still succeed
        let same = exec.update("users", &json!(1), &json!({"age": 99})).unwrap();
        assert_eq!(same["age"], 99);

        assert!(matches!(
            exec.update("users", &json!(42), &json!({"age": 1})),
            Err(Error::NotFound(_))
        ));

        assert_eq!(exec.delete("users", &json!(2)).unwrap(), json!({"success": true}));
        assert!(matches!(exec.delete("users", &json!(2)), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_bulk_create_is_atomic() {
        let exec = executor();
        let err = exec
            .bulk_create("t", &json!([{"a": 1}, {"a": 2}, {"a": "INVALID-FOR-SCHEMA"}]))
            .unwrap_err();
        assert!(matches!(err, Error::BulkWriteFailed(_)));
        assert_eq!(exec.count("t", &QueryOptions::default()).unwrap()["count"], 0);

        let ok = exec.bulk_create("t", &json!([{"a": 1}, {"a": 2}])).unwrap();
        assert_eq!(ok["created"], 2);
        assert_eq!(ok["data"][1]["a"], 2);
    }

    #[test]
    fn test_bulk_delete_counts_actual_rows() {
        let exec = executor();
        seed(&exec, 3);
        let result = exec.bulk_delete("users", &json!({"ids": [1, 3, 77]})).unwrap();
        assert_eq!(result, json!({"success": true, "deleted": 2}));
        assert!(exec.bulk_delete("users", &json!({"ids": []})).is_err());
    }

    #[test]
    fn test_unknown_table() {
        let exec = executor();
        assert!(matches!(
            exec.list("missing", &QueryOptions::default()),
            Err(Error::InvalidTable(_))
        ));
    }

    #[test]
    fn test_without_rowid_tables_accept_writes() {
        let exec = executor();

        let row = exec.create("kv", &json!({"k": "alpha"})).unwrap();
        assert_eq!(row, json!({"k": "alpha", "v": "unset"}).as_object().unwrap().clone());

        let bulk = exec
            .bulk_create("kv", &json!([{"k": "beta", "v": "2"}, {"k": "gamma"}]))
            .unwrap();
        assert_eq!(bulk["created"], 2);
        assert_eq!(bulk["data"][1], json!({"k": "gamma", "v": "unset"}));
        assert_eq!(exec.count("kv", &QueryOptions::default()).unwrap()["count"], 3);

        let duplicate = exec.create("kv", &json!({"k": "alpha"}));
        assert!(matches!(duplicate, Err(Error::Database(_))));
        assert_eq!(exec.count("kv", &QueryOptions::default()).unwrap()["count"], 3);
    }
}
