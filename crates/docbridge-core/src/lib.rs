//! docbridge Core Library
//!
//! One collection-oriented document API over two backends: an in-process
//! document engine and SQLite tables with a JSON payload column.

pub mod aggregate;
pub mod config;
pub mod cursor;
pub mod document;
pub mod error;
pub mod filter;
pub mod identity;
pub mod index;
pub mod json;
pub mod options;
pub mod storage;
pub mod update;
pub mod vector;

#[cfg(test)]
pub mod testutils;

pub use config::{Backend, StoreConfig};
pub use cursor::Cursor;
pub use document::{Document, RawRecord, Record, RecordMeta};
pub use error::{Error, Result};
pub use filter::{CompareOp, Filter};
pub use identity::{DocId, PhysicalKey};
pub use index::Index;
pub use json::Map;
pub use options::{Direction, FindOptions, Projection, SortKey, Stage, UpdateOptions, UpdateResult};
pub use storage::{connect, with_transaction, Collection, CollectionExt, Database, Transaction};
pub use update::Update;
pub use vector::{DistanceMetric, HybridHit, HybridQuery, VectorField, VectorHit, VectorIndexType};
