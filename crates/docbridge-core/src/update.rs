//! Update payloads.

use crate::document::{COLLECTION, CREATED_AT, CREATED_BY, ID_FIELD, UPDATED_AT, UPDATED_BY, VERSION};
use crate::error::{Error, Result};
use crate::json::{set_path, validate_field, Map};
use serde_json::Value;

/// Keys callers may not write through an update.
const PROTECTED_FIELDS: &[&str] = &[ID_FIELD, CREATED_BY, CREATED_AT, UPDATED_AT, VERSION, COLLECTION];

/// A normalized set-operations map.
///
/// Keys without a dot replace top-level fields; dotted keys merge into nested
/// objects so siblings survive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Map,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one field assignment.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Record who made the change.
    pub fn updated_by(self, who: impl Into<String>) -> Self {
        self.set(UPDATED_BY, who.into())
    }

    /// Normalize a flat field map or a `{"$set": {...}}` payload.
    pub fn from_map(map: &Map) -> Result<Self> {
        let set = match map.get("$set") {
            Some(Value::Object(set)) if map.len() == 1 => set.clone(),
            Some(_) if map.len() == 1 => {
                return Err(Error::InvalidUpdate("$set expects an object".to_string()))
            }
            _ => {
                if let Some(op) = map.keys().find(|k| k.starts_with('$')) {
                    return Err(Error::InvalidUpdate(format!("unsupported operator {}", op)));
                }
                map.clone()
            }
        };
        for key in set.keys() {
            validate_field(key)?;
        }
        Ok(Self { set })
    }

    /// Parse an update value, which must be a JSON object.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(Error::InvalidUpdate(format!(
                "update must be an object, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Split off `updated_by` and drop bookkeeping keys.
    pub fn sanitized(&self) -> (Map, Option<String>) {
        let mut set = self.set.clone();
        let updated_by = match set.remove(UPDATED_BY) {
            Some(Value::String(who)) => Some(who),
            _ => None,
        };
        set.retain(|key, _| !PROTECTED_FIELDS.contains(&key.as_str()));
        (set, updated_by)
    }

    /// Apply the assignments to a payload in place.
    pub fn apply(&self, doc: &mut Map) {
        let (set, updated_by) = self.sanitized();
        for (field, value) in set {
            set_path(doc, &field, value);
        }
        if let Some(who) = updated_by {
            doc.insert(UPDATED_BY.to_string(), Value::String(who));
        }
    }
}
