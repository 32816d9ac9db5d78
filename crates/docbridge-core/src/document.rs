//! Document records and typed reconstruction.
//!
//! Backends return [`RawRecord`]s: the JSON payload plus whatever bookkeeping
//! the backend keeps outside of it. [`RawRecord::decode`] merges the two and
//! deserializes into any [`Record`] type.

use crate::error::{Error, Result};
use crate::identity::{DocId, PhysicalKey};
use crate::json::Map;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External identity key.
pub const ID_FIELD: &str = "_id";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const VERSION: &str = "_version";
pub const DELETED_AT: &str = "deleted_at";
/// Owning collection; never stored in payloads.
pub const COLLECTION: &str = "collection";

/// Render a timestamp the way both backends store it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid timestamp {:?}: {}", s, e)))
}

/// Bookkeeping held outside the payload.
///
/// Every field is optional: the document engine keeps none of it, the
/// relational backend fills all of it from columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMeta {
    pub physical_key: Option<PhysicalKey>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One result row before typed decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: DocId,
    pub data: Map,
    pub meta: RecordMeta,
}

impl RawRecord {
    /// A record with no out-of-payload bookkeeping.
    pub fn from_payload(id: DocId, data: Map) -> Self {
        Self {
            id,
            data,
            meta: RecordMeta::default(),
        }
    }

    /// The payload with column-sourced fields merged in.
    pub fn into_map(self) -> Map {
        let RawRecord { id, mut data, meta } = self;
        data.insert(ID_FIELD.to_string(), Value::from(id));
        if let Some(by) = meta.created_by {
            data.insert(CREATED_BY.to_string(), Value::String(by));
        }
        if let Some(by) = meta.updated_by {
            data.insert(UPDATED_BY.to_string(), Value::String(by));
        }
        if let Some(ts) = meta.created_at {
            data.insert(CREATED_AT.to_string(), Value::String(format_timestamp(&ts)));
        }
        if let Some(ts) = meta.updated_at {
            data.insert(UPDATED_AT.to_string(), Value::String(format_timestamp(&ts)));
        }
        if let Some(version) = meta.version {
            data.insert(VERSION.to_string(), Value::from(version));
        }
        data
    }

    /// Decode into a typed record.
    ///
    /// The merged map is deserialized, then [`Record::reconcile`] sees the
    /// same map together with the metadata that has no payload
    /// representation. Fields a type skips during deserialization, such as a
    /// credential hash, are recovered from the map there.
    pub fn decode<T: Record>(self) -> Result<T> {
        let meta = self.meta.clone();
        let map = self.into_map();
        let mut record: T = serde_json::from_value(Value::Object(map.clone()))?;
        record.reconcile(&map, &meta);
        Ok(record)
    }
}

/// A type results can be decoded into.
pub trait Record: DeserializeOwned + Send + 'static {
    /// Copy what serde cannot see into the decoded value: fields excluded
    /// from deserialization, read from the merged `payload`, and bookkeeping
    /// from `meta`.
    fn reconcile(&mut self, _payload: &Map, _meta: &RecordMeta) {}
}

impl Record for Map {}

impl Record for Value {}

/// The well-known document shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(rename = "_version", default)]
    pub version: i64,

    /// Soft-delete marker; only set by lower-level reads
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Relational row key, if the backend has one
    #[serde(skip)]
    pub physical_key: Option<PhysicalKey>,

    #[serde(flatten)]
    pub fields: Map,
}

impl Document {
    /// A new document with a fresh identity.
    pub fn new(fields: Map) -> Self {
        Self {
            id: DocId::new(),
            created_by: None,
            updated_by: None,
            created_at: None,
            updated_at: None,
            version: 0,
            deleted_at: None,
            physical_key: None,
            fields,
        }
    }

    /// Get a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        crate::json::get_path(&self.fields, field)
    }
}

impl Record for Document {
    fn reconcile(&mut self, _payload: &Map, meta: &RecordMeta) {
        self.physical_key = meta.physical_key;
        self.deleted_at = meta.deleted_at;
        if let Some(version) = meta.version {
            self.version = version;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> RawRecord {
        let id = DocId::new();
        RawRecord {
            id,
            data: json!({"_id": id.to_hex(), "name": "Alice", "settings": {"theme": "dark"}})
                .as_object()
                .cloned()
                .unwrap(),
            meta: RecordMeta {
                physical_key: Some(PhysicalKey::new()),
                created_by: Some("admin".to_string()),
                updated_by: Some("editor".to_string()),
                created_at: Some(Utc::now()),
                updated_at: Some(Utc::now()),
                version: Some(3),
                deleted_at: None,
            },
        }
    }

    #[test]
    fn test_into_map_merges_columns() {
        let raw = record();
        let map = raw.clone().into_map();
        assert_eq!(map[ID_FIELD], json!(raw.id.to_hex()));
        assert_eq!(map[CREATED_BY], json!("admin"));
        assert_eq!(map[VERSION], json!(3));
        assert!(map[CREATED_AT].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_decode_document_reconciles_meta() {
        let raw = record();
        let physical = raw.meta.physical_key;
        let doc: Document = raw.clone().decode().unwrap();
        assert_eq!(doc.id, raw.id);
        assert_eq!(doc.physical_key, physical);
        assert_eq!(doc.updated_by.as_deref(), Some("editor"));
        assert_eq!(doc.version, 3);
        assert_eq!(doc.get("settings.theme"), Some(&json!("dark")));
        assert!(!doc.fields.contains_key(VERSION));
    }

    #[derive(Debug, Deserialize)]
    struct Account {
        name: String,
        #[serde(skip_deserializing)]
        password_hash: Option<String>,
    }

    impl Record for Account {
        fn reconcile(&mut self, payload: &Map, _meta: &RecordMeta) {
            self.password_hash = payload
                .get("password_hash")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }

    #[test]
    fn test_decode_recovers_skipped_fields() {
        let id = DocId::new();
        let raw = RawRecord::from_payload(
            id,
            json!({"name": "Alice", "password_hash": "$argon2id$abc"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let account: Account = raw.decode().unwrap();
        assert_eq!(account.name, "Alice");
        assert_eq!(account.password_hash.as_deref(), Some("$argon2id$abc"));
    }

    #[test]
    fn test_decode_payload_only() {
        let id = DocId::new();
        let raw = RawRecord::from_payload(id, json!({"n": 1}).as_object().cloned().unwrap());
        let map: Map = raw.decode().unwrap();
        assert_eq!(Value::Object(map), json!({"_id": id.to_hex(), "n": 1}));
    }

    #[test]
    fn test_timestamp_format_roundtrip() {
        let ts = parse_timestamp("2024-05-01T10:20:30.123Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-01T10:20:30.123Z");
    }
}
