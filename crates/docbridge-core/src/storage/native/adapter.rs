//! Thin adapter from the storage traits to the document engine.
//!
//! Filters, updates and index specifications pass through unchanged. The
//! adapter only makes sure every inserted document carries an `_id`.

use super::engine::{DocumentEngine, Scope};
use crate::config::{Backend, StoreConfig};
use crate::cursor::Cursor;
use crate::document::{RawRecord, ID_FIELD};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::identity::{DocId, Identity};
use crate::index::Index;
use crate::json::Map;
use crate::options::{FindOptions, UpdateOptions, UpdateResult};
use crate::storage::sweeper::Sweeper;
use crate::storage::traits::{Collection, Database, Transaction};
use crate::update::Update;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

fn with_identity(mut doc: Map) -> Result<Map> {
    let identity = Identity::assign(doc.get(ID_FIELD))?;
    doc.insert(ID_FIELD.to_string(), Value::from(identity.id));
    Ok(doc)
}

fn to_record(doc: Map) -> Result<RawRecord> {
    let id = match doc.get(ID_FIELD) {
        Some(Value::String(s)) => DocId::parse(s)?,
        _ => return Err(Error::InvalidIdentity("stored document has no _id".to_string())),
    };
    Ok(RawRecord::from_payload(id, doc))
}

/// Native document database handle.
pub struct NativeDatabase {
    engine: Arc<DocumentEngine>,
    sweeper: Sweeper,
    closed: Arc<AtomicBool>,
}

impl NativeDatabase {
    /// Wrap an existing engine.
    pub fn new(engine: Arc<DocumentEngine>) -> Self {
        Self {
            engine,
            sweeper: Sweeper::default(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a fresh engine for the given configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Arc<Self>> {
        let db = Arc::new(Self::new(Arc::new(DocumentEngine::new())));
        if let Some(interval) = config.ttl_sweep_interval() {
            let as_dyn: Arc<dyn Database> = db.clone();
            let weak: Weak<dyn Database> = Arc::downgrade(&as_dyn);
            db.sweeper.start(weak, interval);
        }
        tracing::info!("document engine started");
        Ok(db)
    }

    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    fn ensure_open(&self) -> Result<()> {
        ensure_open(&self.closed)
    }
}

fn ensure_open(closed: &AtomicBool) -> Result<()> {
    if closed.load(Ordering::Acquire) {
        return Err(Error::Connection("database is closed".to_string()));
    }
    Ok(())
}

#[async_trait]
impl Database for NativeDatabase {
    fn backend(&self) -> Backend {
        Backend::Document
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(NativeCollection {
            engine: self.engine.clone(),
            scope: Scope::Live,
            name: name.to_string(),
            closed: self.closed.clone(),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.sweeper.stop();
        self.closed.store(true, Ordering::Release);
        tracing::info!("document engine closed");
        Ok(())
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.engine.create_collection(name)
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.engine.drop_collection(name)? {
            tracing::info!("dropped collection {}", name);
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.engine.list_collections()
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>> {
        self.ensure_open()?;
        Ok(Arc::new(NativeTransaction {
            engine: self.engine.clone(),
            scope: self.engine.begin()?,
            closed: self.closed.clone(),
        }))
    }

    async fn sweep_expired(&self) -> Result<u64> {
        self.ensure_open()?;
        self.engine.expire(Utc::now())
    }
}

/// Snapshot transaction over the engine.
pub struct NativeTransaction {
    engine: Arc<DocumentEngine>,
    scope: Scope,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transaction for NativeTransaction {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(NativeCollection {
            engine: self.engine.clone(),
            scope: self.scope.clone(),
            name: name.to_string(),
            closed: self.closed.clone(),
        })
    }

    async fn commit(&self) -> Result<()> {
        self.engine.commit(&self.scope)
    }

    async fn rollback(&self) -> Result<()> {
        self.engine.rollback(&self.scope)
    }
}

/// Collection view over the engine, live or inside a transaction.
pub struct NativeCollection {
    engine: Arc<DocumentEngine>,
    scope: Scope,
    name: String,
    closed: Arc<AtomicBool>,
}

impl NativeCollection {
    fn engine(&self) -> Result<&DocumentEngine> {
        ensure_open(&self.closed)?;
        Ok(&self.engine)
    }
}

#[async_trait]
impl Collection for NativeCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, doc: Map) -> Result<DocId> {
        self.engine()?.insert(&self.scope, &self.name, with_identity(doc)?)
    }

    async fn insert_many(&self, docs: Vec<Map>) -> Result<Vec<DocId>> {
        let docs = docs.into_iter().map(with_identity).collect::<Result<Vec<_>>>()?;
        self.engine()?.insert_many(&self.scope, &self.name, docs)
    }

    async fn find_one(&self, filter: &Filter) -> Result<RawRecord> {
        let options = FindOptions::default().limit(1);
        let doc = self
            .engine()?
            .find(&self.scope, &self.name, filter, &options)?
            .into_iter()
            .next()
            .ok_or(Error::NoDocuments)?;
        to_record(doc)
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Cursor> {
        let records = self
            .engine()?
            .find(&self.scope, &self.name, filter, options)?
            .into_iter()
            .map(to_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(Cursor::from_records(records))
    }

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.engine()?
            .update(&self.scope, &self.name, filter, update, false, options.upsert)
    }

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.engine()?
            .update(&self.scope, &self.name, filter, update, true, options.upsert)
    }

    async fn replace_one(&self, filter: &Filter, doc: Map) -> Result<UpdateResult> {
        self.engine()?.replace_one(&self.scope, &self.name, filter, doc)
    }

    async fn delete_one(&self, filter: &Filter) -> Result<u64> {
        self.engine()?.delete(&self.scope, &self.name, filter, false)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.engine()?.delete(&self.scope, &self.name, filter, true)
    }

    async fn count_documents(&self, filter: &Filter) -> Result<u64> {
        self.engine()?.count(&self.scope, &self.name, filter)
    }

    async fn create_index(&self, index: &Index) -> Result<String> {
        self.engine()?.create_index(&self.scope, &self.name, index)
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        self.engine()?.list_indexes(&self.scope, &self.name)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.engine()?.drop_index(&self.scope, &self.name, name)
    }
}
