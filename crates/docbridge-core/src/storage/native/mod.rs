//! Native document backend.

mod adapter;
mod engine;

pub use adapter::{NativeCollection, NativeDatabase, NativeTransaction};
pub use engine::{CollectionData, DocumentEngine, Scope, TxState};
