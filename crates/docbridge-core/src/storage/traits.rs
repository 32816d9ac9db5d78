//! Storage trait definitions.

use crate::aggregate::{apply_stages, plan};
use crate::config::{Backend, StoreConfig};
use crate::cursor::Cursor;
use crate::document::{RawRecord, Record};
use crate::error::Result;
use crate::filter::Filter;
use crate::identity::DocId;
use crate::index::Index;
use crate::json::{get_path, to_map, values_equal, Map};
use crate::options::{FindOptions, Stage, UpdateOptions, UpdateResult};
use crate::update::Update;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A logical collection of documents.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Logical collection name.
    fn name(&self) -> &str;

    /// Insert a document, assigning an identity when it has none.
    async fn insert_one(&self, doc: Map) -> Result<DocId>;

    /// Insert a batch. Either every document is stored or none is.
    async fn insert_many(&self, docs: Vec<Map>) -> Result<Vec<DocId>>;

    /// First matching document, or [`Error::NoDocuments`](crate::Error::NoDocuments).
    async fn find_one(&self, filter: &Filter) -> Result<RawRecord>;

    /// Lazy cursor over matching documents.
    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Cursor>;

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    /// Replace the payload of the first match, keeping its identity.
    async fn replace_one(&self, filter: &Filter, doc: Map) -> Result<UpdateResult>;

    /// Delete the first match; returns the number deleted.
    async fn delete_one(&self, filter: &Filter) -> Result<u64>;

    async fn delete_many(&self, filter: &Filter) -> Result<u64>;

    async fn count_documents(&self, filter: &Filter) -> Result<u64>;

    /// Create an index; creating the same key set again returns the existing name.
    async fn create_index(&self, index: &Index) -> Result<String>;

    /// Every index, including the implicit `_id_` index.
    async fn list_indexes(&self) -> Result<Vec<Index>>;

    async fn drop_index(&self, name: &str) -> Result<()>;

    /// Distinct values of `field` among matching documents.
    ///
    /// Array values contribute their elements.
    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Value>> {
        let records = self
            .find(filter, &FindOptions::default())
            .await?
            .collect_raw()
            .await?;
        let mut values: Vec<Value> = Vec::new();
        for record in records {
            let map = record.into_map();
            let candidates = match get_path(&map, field) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for candidate in candidates {
                if !values.iter().any(|v| values_equal(v, &candidate)) {
                    values.push(candidate);
                }
            }
        }
        Ok(values)
    }

    /// Run an aggregation pipeline.
    async fn aggregate(&self, stages: &[Stage]) -> Result<Vec<Map>> {
        let plan = plan(stages);
        let records = self
            .find(&plan.filter, &plan.options)
            .await?
            .collect_raw()
            .await?;
        let docs = records.into_iter().map(RawRecord::into_map).collect();
        Ok(apply_stages(docs, plan.rest))
    }
}

/// A session-bound unit of work.
///
/// Collections obtained from [`Transaction::collection`] run inside the
/// transaction. Using [`Database::collection`] while a transaction is open is
/// not supported.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Collection bound to this transaction's session.
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Top-level store handle.
#[async_trait]
pub trait Database: Send + Sync {
    fn backend(&self) -> Backend;

    /// Lazy collection lookup; never fails.
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    async fn ping(&self) -> Result<()>;

    /// Stop background work and release the backend.
    async fn close(&self) -> Result<()>;

    async fn create_collection(&self, name: &str) -> Result<()>;

    async fn drop_collection(&self, name: &str) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn begin(&self) -> Result<Arc<dyn Transaction>>;

    /// Expire documents covered by TTL indexes; returns how many expired.
    async fn sweep_expired(&self) -> Result<u64>;
}

/// Typed convenience methods for every collection.
#[async_trait]
pub trait CollectionExt: Collection {
    /// [`Collection::find_one`] decoded into `T`.
    async fn find_one_as<T: Record>(&self, filter: &Filter) -> Result<T> {
        self.find_one(filter).await?.decode()
    }

    async fn find_by_id(&self, id: &DocId) -> Result<RawRecord> {
        self.find_one(&Filter::id(id)).await
    }

    /// Serialize `value` and insert it.
    async fn insert<T: Serialize + Sync + ?Sized>(&self, value: &T) -> Result<DocId> {
        let map = to_map(value)?;
        self.insert_one(map).await
    }
}

impl<C: Collection + ?Sized> CollectionExt for C {}

/// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
pub async fn with_transaction<R, F>(db: &dyn Database, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(Arc<dyn Transaction>) -> BoxFuture<'static, Result<R>> + Send,
{
    let tx = db.begin().await?;
    match f(tx.clone()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("rollback after failed transaction also failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// Open the configured backend.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Database>> {
    config.validate()?;
    tracing::info!("connecting to {} backend", config.backend.as_str());
    let db: Arc<dyn Database> = match config.backend {
        Backend::Sqlite => super::sqlite::SqliteDatabase::connect(config).await?,
        Backend::Document => super::native::NativeDatabase::connect(config).await?,
    };
    Ok(db)
}
