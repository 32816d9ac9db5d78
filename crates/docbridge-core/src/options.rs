//! Find, update and aggregation options.

use crate::filter::Filter;
use crate::identity::DocId;
use crate::json::{get_path, set_path, Map};
use crate::document::ID_FIELD;
use serde::{Deserialize, Serialize};

/// Sort or index direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    /// `1` or `-1`, as used in index names.
    pub fn as_i32(&self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }

    /// Parse `1` / `-1` style directions.
    pub fn from_i64(value: i64) -> Self {
        if value < 0 {
            Direction::Descending
        } else {
            Direction::Ascending
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// Field projection. `_id` is always kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    /// Apply the projection to a payload in place.
    pub fn apply(&self, doc: &mut Map) {
        match self {
            Projection::Include(fields) => {
                let mut kept = Map::new();
                if let Some(id) = doc.get(ID_FIELD) {
                    kept.insert(ID_FIELD.to_string(), id.clone());
                }
                for field in fields {
                    if let Some(value) = get_path(doc, field) {
                        set_path(&mut kept, field, value.clone());
                    }
                }
                *doc = kept;
            }
            Projection::Exclude(fields) => {
                for field in fields.iter().filter(|f| f.as_str() != ID_FIELD) {
                    crate::json::remove_path(doc, field);
                }
            }
        }
    }
}

/// Options for `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub sort: Vec<SortKey>,
    pub projection: Option<Projection>,
    /// Overrides the store's cursor batch size
    pub batch_size: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// Options for `update_one` / `update_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document built from the filter and update when nothing matches
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// Outcome of an update or replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<DocId>,
}

/// Aggregation pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    Project(Projection),
    /// Replace the stream with one `{name: count}` document
    Count(String),
}
