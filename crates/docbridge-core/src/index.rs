//! Index specifications.

use crate::error::{Error, Result};
use crate::json::validate_field;
use crate::options::Direction;
use serde::{Deserialize, Serialize};

/// Name of the implicit identity index.
pub const ID_INDEX_NAME: &str = "_id_";

/// One indexed field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

impl IndexKey {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Parse `field` or `field:-1`.
    pub fn parse(s: &str) -> Result<Self> {
        let (field, direction) = match s.rsplit_once(':') {
            Some((field, dir)) => {
                let dir: i64 = dir
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidIndex(format!("bad direction in {:?}", s)))?;
                (field, Direction::from_i64(dir))
            }
            None => (s, Direction::Ascending),
        };
        validate_field(field)?;
        Ok(Self::new(field, direction))
    }
}

/// A collection index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Defaults to the key-derived name
    pub name: Option<String>,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    /// Skip documents missing every indexed field
    #[serde(default)]
    pub sparse: bool,
    /// Expire documents this many seconds after the indexed timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.keys.push(IndexKey::new(field, direction));
        self
    }

    pub fn asc(self, field: impl Into<String>) -> Self {
        self.key(field, Direction::Ascending)
    }

    pub fn desc(self, field: impl Into<String>) -> Self {
        self.key(field, Direction::Descending)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Sort keys alphabetically and fill in the default name.
    pub fn normalized(&self) -> Result<Self> {
        if self.keys.is_empty() {
            return Err(Error::InvalidIndex("index requires at least one key".to_string()));
        }
        let mut keys = self.keys.clone();
        for key in &keys {
            validate_field(&key.field)?;
        }
        keys.sort_by(|a, b| a.field.cmp(&b.field));
        if keys.windows(2).any(|pair| pair[0].field == pair[1].field) {
            return Err(Error::InvalidIndex("duplicate key field".to_string()));
        }
        if self.ttl.is_some() && keys.len() != 1 {
            return Err(Error::InvalidIndex(
                "TTL indexes must have exactly one key".to_string(),
            ));
        }

        let name = match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => default_name(&keys),
        };
        if name == ID_INDEX_NAME {
            return Err(Error::InvalidIndex(format!("{} is reserved", ID_INDEX_NAME)));
        }
        Ok(Self {
            name: Some(name),
            keys,
            unique: self.unique,
            sparse: self.sparse,
            ttl: self.ttl,
        })
    }

    /// Name after normalization, or empty for an unnormalized index.
    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Same fields and directions, ignoring order and options.
    pub fn same_keys(&self, other: &Index) -> bool {
        let mut a = self.keys.clone();
        let mut b = other.keys.clone();
        a.sort_by(|x, y| x.field.cmp(&y.field));
        b.sort_by(|x, y| x.field.cmp(&y.field));
        a == b
    }

    /// The implicit unique index on `_id`.
    pub fn identity() -> Self {
        Self {
            name: Some(ID_INDEX_NAME.to_string()),
            keys: vec![IndexKey::new(crate::document::ID_FIELD, Direction::Ascending)],
            unique: true,
            sparse: false,
            ttl: None,
        }
    }
}

fn default_name(keys: &[IndexKey]) -> String {
    keys.iter()
        .map(|k| format!("{}_{}", k.field, k.direction.as_i32()))
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_sorts_and_names() {
        let index = Index::new().desc("name").asc("age").normalized().unwrap();
        assert_eq!(index.keys[0].field, "age");
        assert_eq!(index.name_str(), "age_1_name_-1");
    }

    #[test]
    fn test_zero_keys_is_error() {
        assert!(Index::new().normalized().is_err());
    }

    #[test]
    fn test_same_keys_ignores_order() {
        let a = Index::new().asc("a").asc("b");
        let b = Index::new().asc("b").asc("a").unique();
        assert!(a.same_keys(&b));
        assert!(!a.same_keys(&Index::new().asc("a").desc("b")));
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(
            IndexKey::parse("created_at:-1").unwrap(),
            IndexKey::new("created_at", Direction::Descending)
        );
        assert_eq!(IndexKey::parse("email").unwrap().direction, Direction::Ascending);
        assert!(IndexKey::parse("email:up").is_err());
    }

    #[test]
    fn test_ttl_requires_single_key() {
        assert!(Index::new().asc("a").asc("b").ttl(60).normalized().is_err());
        assert!(Index::new().asc("expires").ttl(60).normalized().is_ok());
    }
}
