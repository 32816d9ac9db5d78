//! JSON payload helpers shared by both backends.

use crate::error::{Error, Result};
use crate::options::{Direction, SortKey};
use serde_json::Value;
use std::cmp::Ordering;

/// A document payload.
pub type Map = serde_json::Map<String, Value>;

/// Check a (possibly dotted) field name.
///
/// Segments are embedded in quoted JSON paths on the relational backend, so
/// they may not be empty or contain quotes, backslashes or control characters.
pub fn validate_field(field: &str) -> Result<()> {
    if field.is_empty() {
        return Err(Error::InvalidName("empty field name".to_string()));
    }
    for segment in field.split('.') {
        if segment.is_empty() {
            return Err(Error::InvalidName(format!("empty path segment in {:?}", field)));
        }
        if segment
            .chars()
            .any(|c| c == '"' || c == '\\' || c.is_control())
        {
            return Err(Error::InvalidName(format!(
                "unsupported character in field {:?}",
                field
            )));
        }
    }
    Ok(())
}

/// Split a dotted field into path segments.
pub fn split_path(field: &str) -> Vec<&str> {
    field.split('.').collect()
}

/// Look up a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Map, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects and replacing
/// intermediates that are not objects.
pub fn set_path(doc: &mut Map, field: &str, value: Value) {
    let segments = split_path(field);
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = doc;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove a dotted path, returning the removed value.
pub fn remove_path(doc: &mut Map, field: &str) -> Option<Value> {
    let segments = split_path(field);
    let (last, parents) = segments.split_last()?;
    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(*segment)? {
            Value::Object(map) => map,
            _ => return None,
        };
    }
    current.remove(*last)
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// JSON containment: does `target` contain `candidate`?
///
/// Objects contain objects whose every key is present with a contained value;
/// arrays contain arrays whose every element is contained by some element; a
/// top-level array also contains a bare scalar element.
pub fn contains(target: &Value, candidate: &Value) -> bool {
    contains_at(target, candidate, true)
}

fn contains_at(target: &Value, candidate: &Value, top_level: bool) -> bool {
    match (target, candidate) {
        (Value::Object(t), Value::Object(c)) => c.iter().all(|(key, cv)| {
            t.get(key)
                .map(|tv| contains_at(tv, cv, false))
                .unwrap_or(false)
        }),
        (Value::Array(t), Value::Array(c)) => c
            .iter()
            .all(|cv| t.iter().any(|tv| contains_at(tv, cv, false))),
        (Value::Array(t), scalar) if top_level && !scalar.is_object() => {
            t.iter().any(|tv| values_equal(tv, scalar))
        }
        _ => values_equal(target, candidate),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: by type (null, numbers, strings, objects,
/// arrays, booleans), then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let by_type = type_rank(a).cmp(&type_rank(b));
    if by_type != Ordering::Equal {
        return by_type;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, x), (ky, y)) in xs.iter().zip(ys) {
                let ord = kx.cmp(ky).then_with(|| compare_values(x, y));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => Ordering::Equal,
    }
}

/// Ordering between values of the same kind; `None` across kinds.
pub fn compare_same_kind(a: &Value, b: &Value) -> Option<Ordering> {
    if type_rank(a) != type_rank(b) {
        return None;
    }
    Some(compare_values(a, b))
}

/// Stable in-place sort by sort keys; missing fields sort as null.
pub fn sort_maps(docs: &mut [Map], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in keys {
            let av = get_path(a, &key.field).unwrap_or(&Value::Null);
            let bv = get_path(b, &key.field).unwrap_or(&Value::Null);
            let ord = compare_values(av, bv);
            let ord = match key.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Convert any serializable value into a payload map.
pub fn to_map<T: serde::Serialize + ?Sized>(value: &T) -> Result<Map> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidUpdate(format!(
            "documents must serialize to a JSON object, got {}",
            other
        ))),
    }
}
