//! Document identity.
//!
//! Every document has exactly one external identity, a [`DocId`] rendered as
//! 24 lowercase hex characters. The relational backend additionally keys rows
//! by a [`PhysicalKey`]; [`Identity::assign`] is the only place the two are
//! derived from a caller-supplied `_id`.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

/// Length of the hex rendering of a [`DocId`].
pub const DOC_ID_HEX_LEN: usize = 24;

static COUNTER: AtomicU32 = AtomicU32::new(0);
static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();

/// External document identifier: 4-byte timestamp, 5 process-unique bytes,
/// 3-byte counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId([u8; 12]);

impl DocId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let unique = PROCESS_UNIQUE.get_or_init(rand::random::<[u8; 5]>);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(unique);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Create a DocId from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Convert to the external hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the external hex form.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != DOC_ID_HEX_LEN {
            return Err(Error::InvalidIdentity(format!(
                "expected {} hex characters, got {:?}",
                DOC_ID_HEX_LEN, s
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::InvalidIdentity(format!("{}: {}", s, e)))?;
        let mut arr = [0u8; 12];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Creation time encoded in the identifier.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .unwrap_or_default()
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for DocId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.to_hex())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<DocId> for Value {
    fn from(id: DocId) -> Self {
        Value::String(id.to_hex())
    }
}

impl Serialize for DocId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DocId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Primary key of a row on the relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalKey(Uuid);

impl PhysicalKey {
    /// Mint a new random key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a UUID string; `None` if it is not one.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PhysicalKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Both identities of a document being inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// External identity, returned to callers and embedded in the payload
    pub id: DocId,
    /// Row key on the relational backend
    pub physical: PhysicalKey,
}

impl Identity {
    /// Resolve a caller-supplied `_id`.
    ///
    /// - absent or null: both identities are minted
    /// - a UUID string: reused as the physical key, a fresh external id is minted
    /// - a hex document id: kept as the external id, a fresh physical key is minted
    pub fn assign(supplied: Option<&Value>) -> Result<Self> {
        match supplied {
            None | Some(Value::Null) => Ok(Self {
                id: DocId::new(),
                physical: PhysicalKey::new(),
            }),
            Some(Value::String(s)) => {
                if let Some(physical) = PhysicalKey::parse(s) {
                    return Ok(Self {
                        id: DocId::new(),
                        physical,
                    });
                }
                Ok(Self {
                    id: DocId::parse(s)?,
                    physical: PhysicalKey::new(),
                })
            }
            Some(other) => Err(Error::InvalidIdentity(format!(
                "_id must be a string, got {}",
                other
            ))),
        }
    }
}
