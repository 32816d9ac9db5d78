//! Relational backend: documents in SQLite tables with a JSON `data` column.

mod ann;
mod collection;
mod database;
mod functions;
mod schema;
mod session;
mod translate;
mod vector;

pub use collection::SqliteCollection;
pub use database::{SqliteDatabase, SqliteTransaction};
