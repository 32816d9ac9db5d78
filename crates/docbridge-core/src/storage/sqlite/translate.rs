//! Filter, sort and update translation to SQL over the `data` column.
//!
//! Every fragment uses positional `?` parameters; `params` holds their values
//! in textual order.

use super::schema::{path_literal, path_literal_unchecked};
use crate::document::{CREATED_AT, CREATED_BY, ID_FIELD, UPDATED_AT, UPDATED_BY, VERSION};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::json::{split_path, Map};
use crate::options::{Direction, SortKey};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

const BACKEND: &str = "sqlite";

/// A SQL fragment and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn with_param(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }
}

/// Convert a JSON scalar to a bound parameter.
pub(crate) fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Bookkeeping fields that live in their own columns.
fn column_for(field: &str) -> Option<&'static str> {
    match field {
        CREATED_BY => Some("_created_by"),
        UPDATED_BY => Some("_updated_by"),
        CREATED_AT => Some("_created_at"),
        UPDATED_AT => Some("_updated_at"),
        VERSION => Some("_version"),
        _ => None,
    }
}

/// Translate a filter into a `WHERE` predicate.
///
/// Only equality, null/absence, containment and conjunction translate; any
/// other operator is an [`Error::UnsupportedFilter`].
pub(crate) fn translate_filter(filter: &Filter) -> Result<Fragment> {
    match filter {
        Filter::And(parts) if parts.is_empty() => Ok(Fragment::new("1")),
        Filter::And(parts) => {
            let mut sql = Vec::with_capacity(parts.len());
            let mut params = Vec::new();
            for part in parts {
                let fragment = translate_filter(part)?;
                sql.push(format!("({})", fragment.sql));
                params.extend(fragment.params);
            }
            Ok(Fragment {
                sql: sql.join(" AND "),
                params,
            })
        }
        Filter::Eq { field, value } => translate_eq(field, value),
        Filter::IsNull { field } => {
            if let Some(column) = column_for(field) {
                return Ok(Fragment::new(format!("{} IS NULL", column)));
            }
            let path = path_literal(field)?;
            Ok(Fragment::new(format!(
                "(json_type(data, {p}) IS NULL OR json_type(data, {p}) = 'null')",
                p = path
            )))
        }
        Filter::Contains { field, value } => {
            if column_for(field).is_some() {
                return Err(unsupported(filter, field));
            }
            let path = path_literal(field)?;
            Ok(Fragment::new(format!("json_contains(data -> {}, ?)", path))
                .with_param(SqlValue::Text(value.to_string())))
        }
        other => Err(Error::UnsupportedFilter {
            backend: BACKEND,
            operator: other.operator_name(),
        }),
    }
}

fn unsupported(filter: &Filter, field: &str) -> Error {
    Error::UnsupportedFilter {
        backend: BACKEND,
        operator: format!("{} on {}", filter.operator_name(), field),
    }
}

fn translate_eq(field: &str, value: &Value) -> Result<Fragment> {
    if field == ID_FIELD {
        return Ok(Fragment::new("json_extract(data, '$.\"_id\"') = ?").with_param(sql_value(value)));
    }
    if let Some(column) = column_for(field) {
        return Ok(Fragment::new(format!("{} = ?", column)).with_param(sql_value(value)));
    }

    let path = path_literal(field)?;
    let fragment = match value {
        Value::String(_) => Fragment::new(format!(
            "json_type(data, {p}) = 'text' AND json_extract(data, {p}) = ?",
            p = path
        ))
        .with_param(sql_value(value)),
        Value::Bool(b) => Fragment::new(format!(
            "json_type(data, {}) = '{}'",
            path,
            if *b { "true" } else { "false" }
        )),
        Value::Number(_) => Fragment::new(format!(
            "json_type(data, {p}) IN ('integer', 'real') AND json_extract(data, {p}) = ?",
            p = path
        ))
        .with_param(sql_value(value)),
        Value::Null => Fragment::new(format!(
            "(json_type(data, {p}) IS NULL OR json_type(data, {p}) = 'null')",
            p = path
        )),
        Value::Object(_) | Value::Array(_) => {
            Fragment::new(format!("json_contains(data -> {}, ?)", path))
                .with_param(SqlValue::Text(value.to_string()))
        }
    };
    Ok(fragment)
}

/// Translate sort keys into an `ORDER BY` list, ending with insertion order.
pub(crate) fn translate_sort(keys: &[SortKey]) -> Result<String> {
    let mut terms = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        let expr = match column_for(&key.field) {
            Some(column) => column.to_string(),
            None => format!("json_extract(data, {})", path_literal(&key.field)?),
        };
        let dir = match key.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        terms.push(format!("{} {}", expr, dir));
    }
    terms.push("rowid ASC".to_string());
    Ok(terms.join(", "))
}

// -----------------------------------------------------------------------------
// Updates
// -----------------------------------------------------------------------------

/// Assignments grouped by path prefix.
#[derive(Debug)]
enum Node {
    Leaf(Value),
    Branch(Vec<(String, Node)>),
}

fn insert_path(children: &mut Vec<(String, Node)>, segments: &[&str], value: Value, full: &str) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    let position = children.iter().position(|(name, _)| name == head);
    if rest.is_empty() {
        if position.is_some() {
            return Err(Error::InvalidUpdate(format!(
                "{} conflicts with another assignment",
                full
            )));
        }
        children.push((head.to_string(), Node::Leaf(value)));
        return Ok(());
    }
    let index = match position {
        Some(index) => index,
        None => {
            children.push((head.to_string(), Node::Branch(Vec::new())));
            children.len() - 1
        }
    };
    match &mut children[index].1 {
        Node::Branch(grandchildren) => insert_path(grandchildren, rest, value, full),
        Node::Leaf(_) => Err(Error::InvalidUpdate(format!(
            "{} conflicts with another assignment",
            full
        ))),
    }
}

/// Build the `json_set` expression that applies `set` to `data`.
///
/// Top-level keys are replaced in place. A dotted key rebuilds each
/// intermediate object from its current value (or `{}` when it is missing or
/// not an object) so siblings at every level survive.
pub(crate) fn translate_update(set: &Map) -> Result<Fragment> {
    let mut root = Vec::new();
    for (key, value) in set {
        insert_path(&mut root, &split_path(key), value.clone(), key)?;
    }
    if root.is_empty() {
        return Ok(Fragment::new("data"));
    }
    let mut params = Vec::new();
    let sql = render_set("data", &root, &mut Vec::new(), &mut params);
    Ok(Fragment { sql, params })
}

fn render_set<'a>(
    base: &str,
    children: &'a [(String, Node)],
    prefix: &mut Vec<&'a str>,
    params: &mut Vec<SqlValue>,
) -> String {
    let mut args = vec![base.to_string()];
    for (name, node) in children {
        args.push(path_literal_unchecked(&[name.as_str()]));
        match node {
            Node::Leaf(value) => {
                args.push("json(?)".to_string());
                params.push(SqlValue::Text(value.to_string()));
            }
            Node::Branch(grandchildren) => {
                prefix.push(name.as_str());
                let path = path_literal_unchecked(prefix);
                let container = format!(
                    "CASE WHEN json_type(data, {p}) = 'object' THEN json_extract(data, {p}) ELSE '{{}}' END",
                    p = path
                );
                args.push(render_set(&container, grandchildren, prefix, params));
                prefix.pop();
            }
        }
    }
    format!("json_set({})", args.join(", "))
}
