//! Filter expressions.
//!
//! Runtime filter maps (`{"name": "a", "age": {"$gt": 3}}`) are parsed once
//! into a [`Filter`] tree. The native engine evaluates every variant; the
//! relational backend translates `Eq`, `IsNull`, `Contains` and `And` and
//! rejects the rest.

use crate::error::{Error, Result};
use crate::identity::DocId;
use crate::json::{compare_same_kind, contains, get_path, validate_field, values_equal, Map};
use crate::document::ID_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operators beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// The operator as written in filter maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Ne => "$ne",
            CompareOp::Gt => "$gt",
            CompareOp::Gte => "$gte",
            CompareOp::Lt => "$lt",
            CompareOp::Lte => "$lte",
        }
    }
}

/// A filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals a scalar
    Eq { field: String, value: Value },
    /// Field is JSON null or absent
    IsNull { field: String },
    /// Field contains an object or array fragment
    Contains { field: String, value: Value },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    Exists { field: String, exists: bool },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::all()
    }
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    /// True for the match-everything filter.
    pub fn is_all(&self) -> bool {
        matches!(self, Filter::And(filters) if filters.is_empty())
    }

    /// Value-directed predicate: null becomes an absence check, objects and
    /// arrays become containment, scalars become equality.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        match value.into() {
            Value::Null => Filter::IsNull { field },
            value @ (Value::Object(_) | Value::Array(_)) => Filter::Contains { field, value },
            value => Filter::Eq { field, value },
        }
    }

    /// Match by external identity.
    pub fn id(id: &DocId) -> Self {
        Filter::Eq {
            field: ID_FIELD.to_string(),
            value: Value::String(id.to_hex()),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull {
            field: field.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Filter::Exists {
            field: field.into(),
            exists,
        }
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = match self {
            Filter::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Filter::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Filter::And(parts)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Parse a filter value, which must be a JSON object.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Filter::all()),
            other => Err(Error::InvalidFilter(format!(
                "filter must be an object, got {}",
                other
            ))),
        }
    }

    /// Parse a runtime filter map into a conjunction.
    pub fn from_map(map: &Map) -> Result<Self> {
        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let branches = value
                        .as_array()
                        .ok_or_else(|| Error::InvalidFilter(format!("{} expects an array", key)))?
                        .iter()
                        .map(Filter::from_value)
                        .collect::<Result<Vec<_>>>()?;
                    parts.push(if key == "$and" {
                        Filter::And(branches)
                    } else {
                        Filter::Or(branches)
                    });
                }
                op if op.starts_with('$') => {
                    return Err(Error::InvalidFilter(format!(
                        "unknown top-level operator {}",
                        op
                    )))
                }
                field => {
                    validate_field(field)?;
                    parts.push(Self::parse_field(field, value)?);
                }
            }
        }
        Ok(match parts.len() {
            1 => parts.remove(0),
            _ => Filter::And(parts),
        })
    }

    fn parse_field(field: &str, value: &Value) -> Result<Self> {
        let operators = match value {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
            _ => return Ok(Filter::eq(field, value.clone())),
        };

        let mut parts = Vec::with_capacity(operators.len());
        for (op, operand) in operators {
            let part = match op.as_str() {
                "$eq" => Filter::eq(field, operand.clone()),
                "$ne" => Filter::compare(field, CompareOp::Ne, operand.clone()),
                "$gt" => Filter::compare(field, CompareOp::Gt, operand.clone()),
                "$gte" => Filter::compare(field, CompareOp::Gte, operand.clone()),
                "$lt" => Filter::compare(field, CompareOp::Lt, operand.clone()),
                "$lte" => Filter::compare(field, CompareOp::Lte, operand.clone()),
                "$in" | "$nin" => Filter::In {
                    field: field.to_string(),
                    values: operand
                        .as_array()
                        .cloned()
                        .ok_or_else(|| Error::InvalidFilter(format!("{} expects an array", op)))?,
                    negated: op == "$nin",
                },
                "$exists" => Filter::exists(field, operand.as_bool().unwrap_or(!operand.is_null())),
                other => {
                    return Err(Error::InvalidFilter(format!(
                        "unknown operator {} on {}",
                        other, field
                    )))
                }
            };
            parts.push(part);
        }
        Ok(match parts.len() {
            1 => parts.remove(0),
            _ => Filter::And(parts),
        })
    }

    /// Check if a document matches this filter.
    pub fn matches(&self, doc: &Map) -> bool {
        match self {
            Filter::Eq { field, value } => get_path(doc, field)
                .map(|v| equals_or_has_element(v, value))
                .unwrap_or(false),
            Filter::IsNull { field } => {
                matches!(get_path(doc, field), None | Some(Value::Null))
            }
            Filter::Contains { field, value } => get_path(doc, field)
                .map(|v| contains(v, value))
                .unwrap_or(false),
            Filter::Compare { field, op, value } => {
                let current = get_path(doc, field);
                match op {
                    CompareOp::Ne => !current
                        .map(|v| equals_or_has_element(v, value))
                        .unwrap_or(value.is_null()),
                    _ => current
                        .and_then(|v| compare_same_kind(v, value))
                        .map(|ord| match op {
                            CompareOp::Gt => ord == Ordering::Greater,
                            CompareOp::Gte => ord != Ordering::Less,
                            CompareOp::Lt => ord == Ordering::Less,
                            CompareOp::Lte => ord != Ordering::Greater,
                            CompareOp::Ne => unreachable!(),
                        })
                        .unwrap_or(false),
                }
            }
            Filter::In {
                field,
                values,
                negated,
            } => {
                let current = get_path(doc, field);
                let hit = values.iter().any(|candidate| match current {
                    Some(v) => equals_or_has_element(v, candidate),
                    None => candidate.is_null(),
                });
                hit != *negated
            }
            Filter::Exists { field, exists } => get_path(doc, field).is_some() == *exists,
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }

    /// Equality pairs of a conjunction, used to seed upserted documents.
    pub fn equality_fields(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Eq { field, value } | Filter::Contains { field, value } => {
                vec![(field.as_str(), value)]
            }
            Filter::And(filters) => filters.iter().flat_map(|f| f.equality_fields()).collect(),
            _ => Vec::new(),
        }
    }

    /// Name of the first operator for error messages.
    pub fn operator_name(&self) -> String {
        match self {
            Filter::Eq { .. } => "$eq".to_string(),
            Filter::IsNull { .. } => "$eq:null".to_string(),
            Filter::Contains { .. } => "$contains".to_string(),
            Filter::Compare { op, .. } => op.as_str().to_string(),
            Filter::In { negated, .. } => if *negated { "$nin" } else { "$in" }.to_string(),
            Filter::Exists { .. } => "$exists".to_string(),
            Filter::And(_) => "$and".to_string(),
            Filter::Or(_) => "$or".to_string(),
        }
    }
}

fn equals_or_has_element(current: &Value, expected: &Value) -> bool {
    if values_equal(current, expected) {
        return true;
    }
    match current {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}
