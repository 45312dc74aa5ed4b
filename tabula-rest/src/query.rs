//! Filter/sort grammar and pagination options
//!
//! Filters are comma-separated clauses, either `col:value` (equality, or
//! `like` when the value holds a `*`/`%` wildcard) or `col:op:value`.
//! Clauses naming an unknown column or operator are dropped and the rest
//! still apply. Sort expressions are `col:asc|desc`, `-col` or `col`; a
//! single bad entry rejects the whole expression.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use tabula_common::error::{Error, Result};
use tabula_common::types::TableDescriptor;

use crate::db::quote_ident;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("identifier pattern compiles"));

/// Identifier safety check applied to every table and column name
#[must_use]
pub fn is_safe_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

// ============================================================================
// Query Options
// ============================================================================

/// Per-request listing options, parsed from untrusted query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub fields: Vec<String>,
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            fields: vec![],
            filter: None,
            sort: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QueryOptions {
    /// Build options from `fields`, `filter`, `sort`, `page` and `page_size`
    #[must_use]
    pub fn from_params(params: &HashMap<String, String>, default_page_size: u32, max_page_size: u32) -> Self {
        let get = |name: &str| params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let fields = get("fields")
            .map(|f| {
                f.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            fields,
            filter: get("filter").map(String::from),
            sort: get("sort").map(String::from),
            page: parse_page(get("page")),
            page_size: parse_page_size(get("page_size"), default_page_size, max_page_size),
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// Page number: floored, at least 1, 1 when missing or non-numeric
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_page(raw: Option<&str>) -> u32 {
    match raw.and_then(|v| v.parse::<f64>().ok()) {
        Some(p) if p.is_finite() && p >= 1.0 => p.floor().min(f64::from(u32::MAX)) as u32,
        _ => 1,
    }
}

/// Page size: floored and clamped into `[1, max]`, the default when missing or non-numeric
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_page_size(raw: Option<&str>, default: u32, max: u32) -> u32 {
    let max = max.clamp(1, MAX_PAGE_SIZE);
    let size = match raw.and_then(|v| v.parse::<f64>().ok()) {
        Some(s) if s.is_finite() => s.floor().clamp(1.0, f64::from(max)) as u32,
        _ => default,
    };
    size.clamp(1, max)
}

/// Column projection: the valid requested fields in order, or `*`
#[must_use]
pub fn projection(table: &TableDescriptor, fields: &[String]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .filter(|f| is_safe_identifier(f) && table.has_column(f))
        .map(|f| quote_ident(f))
        .collect();

    if columns.is_empty() {
        "*".to_string()
    } else {
        columns.join(", ")
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Filter operators accepted in `col:op:value` clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
    Null,
    NotNull,
}

impl FilterOperator {
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op.to_ascii_lowercase().as_str() {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "like" => Self::Like,
            "in" => Self::In,
            "notin" => Self::NotIn,
            "null" => Self::Null,
            "notnull" => Self::NotNull,
            _ => return None,
        })
    }

    fn comparison(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Null => "IS NULL",
            Self::NotNull => "IS NOT NULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    None,
    Single(String),
    List(Vec<String>),
}

/// One validated filter clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterClause {
    pub column: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

/// WHERE conditions plus their bound parameters, in clause order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    pub clauses: Vec<FilterClause>,
    pub conditions: Vec<String>,
    pub params: Vec<(String, String)>,
}

impl CompiledFilter {
    /// Conditions joined with `AND`, `None` when nothing survived validation
    #[must_use]
    pub fn where_sql(&self) -> Option<String> {
        if self.conditions.is_empty() {
            None
        } else {
            Some(self.conditions.join(" AND "))
        }
    }
}

/// Parse a filter expression against the column whitelist, dropping invalid clauses
#[must_use]
pub fn parse_filter(valid_columns: &HashSet<String>, expr: &str) -> Vec<FilterClause> {
    expr.split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .filter_map(|raw| parse_clause(valid_columns, raw))
        .collect()
}

fn parse_clause(valid_columns: &HashSet<String>, raw: &str) -> Option<FilterClause> {
    let parts: Vec<&str> = raw.splitn(3, ':').map(str::trim).collect();
    let column = *parts.first()?;
    if !is_safe_identifier(column) || !valid_columns.contains(column) {
        return None;
    }

    let (operator, value) = match parts.as_slice() {
        [_, value] => match FilterOperator::parse(value) {
            Some(op @ (FilterOperator::Null | FilterOperator::NotNull)) => (op, FilterValue::None),
            _ if value.contains('*') || value.contains('%') => (
                FilterOperator::Like,
                FilterValue::Single(value.replace('*', "%")),
            ),
            _ => (FilterOperator::Eq, FilterValue::Single((*value).to_string())),
        },
        [_, op, value] => {
            let operator = FilterOperator::parse(op)?;
            let value = match operator {
                FilterOperator::Null | FilterOperator::NotNull => FilterValue::None,
                FilterOperator::In | FilterOperator::NotIn => {
                    let items: Vec<String> = value
                        .split('|')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(String::from)
                        .collect();
                    if items.is_empty() {
                        return None;
                    }
                    FilterValue::List(items)
                }
                FilterOperator::Like => {
                    let pattern = value.replace('*', "%");
                    if pattern.contains('%') {
                        FilterValue::Single(pattern)
                    } else {
                        FilterValue::Single(format!("%{pattern}%"))
                    }
                }
                _ => FilterValue::Single((*value).to_string()),
            };
            (operator, value)
        }
        _ => return None,
    };

    Some(FilterClause {
        column: column.to_string(),
        operator,
        value,
    })
}

/// Compile a filter expression into parameterized WHERE conditions
///
/// Every literal is bound as `:f{n}` (or `:f{n}_{m}` for list members);
/// nothing from the expression is interpolated except validated column names.
#[must_use]
pub fn compile_filter(valid_columns: &HashSet<String>, expr: Option<&str>) -> CompiledFilter {
    let Some(expr) = expr else {
        return CompiledFilter::default();
    };

    let mut compiled = CompiledFilter::default();
    for (i, clause) in parse_filter(valid_columns, expr).into_iter().enumerate() {
        let column = quote_ident(&clause.column);
        let op = clause.operator.comparison();

        let condition = match &clause.value {
            FilterValue::None => format!("{column} {op}"),
            FilterValue::Single(value) => {
                let name = format!(":f{i}");
                compiled.params.push((name.clone(), value.clone()));
                format!("{column} {op} {name}")
            }
            FilterValue::List(values) => {
                let names: Vec<String> = values
                    .iter()
                    .enumerate()
                    .map(|(j, value)| {
                        let name = format!(":f{i}_{j}");
                        compiled.params.push((name.clone(), value.clone()));
                        name
                    })
                    .collect();
                format!("{column} {op} ({})", names.join(", "))
            }
        };

        compiled.conditions.push(condition);
        compiled.clauses.push(clause);
    }
    compiled
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortClause {
    pub column: String,
    pub direction: SortDirection,
}

/// Validate a sort expression; any invalid entry rejects all of it
///
/// # Errors
/// Returns `Error::InvalidSort` naming the first offending entry.
pub fn compile_sort(valid_columns: &HashSet<String>, expr: Option<&str>) -> Result<Vec<SortClause>> {
    let Some(expr) = expr else {
        return Ok(vec![]);
    };

    let mut clauses = Vec::new();
    for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (column, direction) = if let Some((column, dir)) = part.split_once(':') {
            let direction = match dir.trim().to_ascii_lowercase().as_str() {
                "asc" => SortDirection::Asc,
                "desc" => SortDirection::Desc,
                _ => return Err(Error::InvalidSort(part.to_string())),
            };
            (column.trim(), direction)
        } else if let Some(column) = part.strip_prefix('-') {
            (column, SortDirection::Desc)
        } else {
            (part, SortDirection::Asc)
        };

        if !is_safe_identifier(column) || !valid_columns.contains(column) {
            return Err(Error::InvalidSort(part.to_string()));
        }
        clauses.push(SortClause {
            column: column.to_string(),
            direction,
        });
    }
    Ok(clauses)
}

/// `ORDER BY` body for validated clauses
#[must_use]
pub fn order_sql(clauses: &[SortClause]) -> Option<String> {
    if clauses.is_empty() {
        return None;
    }
    let parts: Vec<String> = clauses
        .iter()
        .map(|c| {
            let dir = match c.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {dir}", quote_ident(&c.column))
        })
        .collect();
    Some(parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> HashSet<String> {
        ["id", "name", "age", "status", "created_at", "deleted_at"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_three_part_clauses() {
        let compiled = compile_filter(&columns(), Some("age:gt:18,status:eq:active"));
        assert_eq!(compiled.conditions, vec!["\"age\" > :f0", "\"status\" = :f1"]);
        assert_eq!(
            compiled.params,
            vec![
                (":f0".to_string(), "18".to_string()),
                (":f1".to_string(), "active".to_string())
            ]
        );
        assert_eq!(
            compiled.where_sql().unwrap(),
            "\"age\" > :f0 AND \"status\" = :f1"
        );
    }

    #[test]
    fn test_legacy_two_part_clauses() {
        let clauses = parse_filter(&columns(), "status:active,name:jo*");
        assert_eq!(clauses[0].operator, FilterOperator::Eq);
        assert_eq!(clauses[1].operator, FilterOperator::Like);
        assert_eq!(clauses[1].value, FilterValue::Single("jo%".into()));

        let clauses = parse_filter(&columns(), "deleted_at:null");
        assert_eq!(clauses[0].operator, FilterOperator::Null);
        assert_eq!(clauses[0].value, FilterValue::None);
    }

    #[test]
    fn test_in_and_null_operators() {
        let compiled = compile_filter(&columns(), Some("status:in:active|pending,deleted_at:notnull:"));
        assert_eq!(
            compiled.conditions,
            vec!["\"status\" IN (:f0_0, :f0_1)", "\"deleted_at\" IS NOT NULL"]
        );
        assert_eq!(compiled.params.len(), 2);

        let compiled = compile_filter(&columns(), Some("id:notin:1|2|3"));
        assert_eq!(compiled.conditions, vec!["\"id\" NOT IN (:f0_0, :f0_1, :f0_2)"]);
    }

    #[test]
    fn test_like_wrapping() {
        let clauses = parse_filter(&columns(), "name:like:ann,status:like:act*");
        assert_eq!(clauses[0].value, FilterValue::Single("%ann%".into()));
        assert_eq!(clauses[1].value, FilterValue::Single("act%".into()));
    }

    #[test]
    fn test_invalid_clauses_dropped() {
        let compiled = compile_filter(
            &columns(),
            Some("password:eq:x,age:between:1,na-me:eq:x,status:eq:active,age:in:"),
        );
        assert_eq!(compiled.conditions, vec!["\"status\" = :f0"]);
        assert_eq!(compiled.clauses.len(), 1);
    }

    #[test]
    fn test_values_never_interpolated() {
        let compiled = compile_filter(&columns(), Some("name:eq:x' OR '1'='1"));
        assert_eq!(compiled.conditions, vec!["\"name\" = :f0"]);
        assert_eq!(compiled.params[0].1, "x' OR '1'='1");
    }

    #[test]
    fn test_values_may_contain_colons() {
        let clauses = parse_filter(&columns(), "created_at:gte:2024-01-01 10:00:00");
        assert_eq!(clauses[0].value, FilterValue::Single("2024-01-01 10:00:00".into()));
    }

    #[test]
    fn test_sort_forms() {
        let sort = compile_sort(&columns(), Some("-created_at,name:ASC,age")).unwrap();
        assert_eq!(sort[0].direction, SortDirection::Desc);
        assert_eq!(sort[1].direction, SortDirection::Asc);
        assert_eq!(sort[2].column, "age");
        assert_eq!(
            order_sql(&sort).unwrap(),
            "\"created_at\" DESC, \"name\" ASC, \"age\" ASC"
        );
    }

    #[test]
    fn test_sort_all_or_nothing() {
        assert!(matches!(
            compile_sort(&columns(), Some("name:asc,password:desc")),
            Err(Error::InvalidSort(_))
        ));
        assert!(compile_sort(&columns(), Some("name:sideways")).is_err());
        assert!(compile_sort(&columns(), None).unwrap().is_empty());
    }

    #[test]
    fn test_page_size_always_clamped() {
        for (raw, expected) in [
            ("0", 1),
            ("-5", 1),
            ("abc", 20),
            ("10000", 100),
            ("15.9", 15),
            ("NaN", 20),
        ] {
            let params = HashMap::from([("page_size".to_string(), raw.to_string())]);
            let opts = QueryOptions::from_params(&params, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE);
            assert_eq!(opts.page_size, expected, "page_size={raw}");
        }
    }

    #[test]
    fn test_page_parsing() {
        let params = HashMap::from([
            ("page".to_string(), "2.7".to_string()),
            ("page_size".to_string(), "10".to_string()),
            ("fields".to_string(), "id, name,".to_string()),
        ]);
        let opts = QueryOptions::from_params(&params, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE);
        assert_eq!(opts.page, 2);
        assert_eq!(opts.offset(), 10);
        assert_eq!(opts.fields, vec!["id", "name"]);

        let params = HashMap::from([("page".to_string(), "-3".to_string())]);
        assert_eq!(QueryOptions::from_params(&params, 20, 100).page, 1);
    }
}
