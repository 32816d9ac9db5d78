//! Storage abstraction layer.
//!
//! Both backends implement the same [`Database`], [`Collection`] and
//! [`Transaction`] traits, so callers hold an `Arc<dyn Database>` and never
//! see which one is running.

mod sweeper;
mod traits;

pub mod native;
pub mod sqlite;

pub use native::{DocumentEngine, NativeDatabase};
pub use sqlite::{SqliteCollection, SqliteDatabase, SqliteTransaction};
pub use traits::{connect, with_transaction, Collection, CollectionExt, Database, Transaction};
