//! In-process document engine.
//!
//! Documents live in per-collection ordered maps keyed by insertion sequence.
//! The engine evaluates every [`Filter`] variant, enforces unique and sparse
//! indexes, expires TTL-indexed documents and runs snapshot transactions that
//! detect write conflicts at commit.

use crate::document::{parse_timestamp, ID_FIELD};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::identity::DocId;
use crate::index::{Index, ID_INDEX_NAME};
use crate::json::{get_path, set_path, sort_maps, values_equal, Map};
use crate::options::{FindOptions, UpdateResult};
use crate::update::Update;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

type Collections = HashMap<String, CollectionData>;

// =============================================================================
// Collection Data
// =============================================================================

/// Documents and indexes of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionData {
    next_seq: u64,
    docs: BTreeMap<u64, Map>,
    ids: HashMap<DocId, u64>,
    indexes: Vec<Index>,
    /// Bumped on every write; compared at transaction commit
    version: u64,
}

impl CollectionData {
    fn doc_id(doc: &Map) -> Result<DocId> {
        match doc.get(ID_FIELD) {
            Some(Value::String(s)) => DocId::parse(s),
            _ => Err(Error::InvalidIdentity("document has no _id".to_string())),
        }
    }

    fn index_key(index: &Index, doc: &Map) -> Option<Vec<Value>> {
        let values: Vec<Option<&Value>> = index
            .keys
            .iter()
            .map(|k| get_path(doc, &k.field))
            .collect();
        if index.sparse && values.iter().all(Option::is_none) {
            return None;
        }
        Some(
            values
                .into_iter()
                .map(|v| v.cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn check_unique(&self, doc: &Map, skip: Option<u64>) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let Some(key) = Self::index_key(index, doc) else {
                continue;
            };
            let clash = self
                .docs
                .iter()
                .filter(|(seq, _)| Some(**seq) != skip)
                .filter_map(|(_, other)| Self::index_key(index, other))
                .any(|other| {
                    other.len() == key.len() && other.iter().zip(&key).all(|(a, b)| values_equal(a, b))
                });
            if clash {
                return Err(Error::DuplicateKey {
                    index: index.name_str().to_string(),
                    key: Value::Array(key).to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, doc: Map) -> Result<DocId> {
        let id = Self::doc_id(&doc)?;
        if self.ids.contains_key(&id) {
            return Err(Error::DuplicateKey {
                index: ID_INDEX_NAME.to_string(),
                key: id.to_hex(),
            });
        }
        self.check_unique(&doc, None)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.docs.insert(seq, doc);
        self.ids.insert(id, seq);
        self.version += 1;
        Ok(id)
    }

    fn matching(&self, filter: &Filter) -> Vec<u64> {
        self.docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(seq, _)| *seq)
            .collect()
    }

    fn find(&self, filter: &Filter, options: &FindOptions) -> Vec<Map> {
        let mut docs: Vec<Map> = self
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        sort_maps(&mut docs, &options.sort);

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut docs: Vec<Map> = docs.into_iter().skip(skip).take(limit).collect();
        if let Some(projection) = &options.projection {
            for doc in docs.iter_mut() {
                projection.apply(doc);
            }
        }
        docs
    }

    fn update(&mut self, filter: &Filter, update: &Update, many: bool, upsert: bool) -> Result<UpdateResult> {
        let mut targets = self.matching(filter);
        if !many {
            targets.truncate(1);
        }

        let mut result = UpdateResult::default();
        for seq in targets {
            let Some(current) = self.docs.get(&seq) else {
                continue;
            };
            let mut next = current.clone();
            update.apply(&mut next);
            result.matched += 1;
            if values_equal(&Value::Object(current.clone()), &Value::Object(next.clone())) {
                continue;
            }
            self.check_unique(&next, Some(seq))?;
            self.docs.insert(seq, next);
            result.modified += 1;
        }

        if result.matched == 0 && upsert {
            let mut seed = Map::new();
            for (field, value) in filter.equality_fields() {
                if field != ID_FIELD {
                    set_path(&mut seed, field, value.clone());
                }
            }
            update.apply(&mut seed);
            let id = DocId::new();
            seed.insert(ID_FIELD.to_string(), Value::from(id));
            self.insert(seed)?;
            result.upserted_id = Some(id);
        } else if result.modified > 0 {
            self.version += 1;
        }
        Ok(result)
    }

    fn replace_one(&mut self, filter: &Filter, mut doc: Map) -> Result<UpdateResult> {
        let Some(seq) = self.matching(filter).into_iter().next() else {
            return Ok(UpdateResult::default());
        };
        let Some(current) = self.docs.get(&seq) else {
            return Ok(UpdateResult::default());
        };
        if let Some(id) = current.get(ID_FIELD) {
            doc.insert(ID_FIELD.to_string(), id.clone());
        }
        let changed = !values_equal(&Value::Object(current.clone()), &Value::Object(doc.clone()));
        if changed {
            self.check_unique(&doc, Some(seq))?;
            self.docs.insert(seq, doc);
            self.version += 1;
        }
        Ok(UpdateResult {
            matched: 1,
            modified: changed as u64,
            upserted_id: None,
        })
    }

    fn remove(&mut self, seqs: &[u64]) -> u64 {
        let mut removed = 0;
        for seq in seqs {
            if let Some(doc) = self.docs.remove(seq) {
                if let Ok(id) = Self::doc_id(&doc) {
                    self.ids.remove(&id);
                }
                removed += 1;
            }
        }
        if removed > 0 {
            self.version += 1;
        }
        removed
    }

    fn delete(&mut self, filter: &Filter, many: bool) -> u64 {
        let mut targets = self.matching(filter);
        if !many {
            targets.truncate(1);
        }
        self.remove(&targets)
    }

    fn create_index(&mut self, index: &Index) -> Result<String> {
        let index = index.normalized()?;
        if let Some(existing) = self.indexes.iter().find(|i| i.same_keys(&index)) {
            return Ok(existing.name_str().to_string());
        }
        if self.indexes.iter().any(|i| i.name == index.name) {
            return Err(Error::InvalidIndex(format!(
                "index {} already exists with different keys",
                index.name_str()
            )));
        }

        if index.unique {
            let mut seen: Vec<Vec<Value>> = Vec::new();
            for doc in self.docs.values() {
                let Some(key) = Self::index_key(&index, doc) else {
                    continue;
                };
                if seen.iter().any(|k| k.iter().zip(&key).all(|(a, b)| values_equal(a, b))) {
                    return Err(Error::DuplicateKey {
                        index: index.name_str().to_string(),
                        key: Value::Array(key).to_string(),
                    });
                }
                seen.push(key);
            }
        }

        let name = index.name_str().to_string();
        self.indexes.push(index);
        self.version += 1;
        Ok(name)
    }

    fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(Error::InvalidIndex("cannot drop the _id index".to_string()));
        }
        let before = self.indexes.len();
        self.indexes.retain(|i| i.name_str() != name);
        if self.indexes.len() == before {
            return Err(Error::InvalidIndex(format!("index {} not found", name)));
        }
        self.version += 1;
        Ok(())
    }

    fn expire(&mut self, now: DateTime<Utc>) -> u64 {
        let ttl_indexes: Vec<(String, u64)> = self
            .indexes
            .iter()
            .filter_map(|i| Some((i.keys.first()?.field.clone(), i.ttl?)))
            .collect();
        if ttl_indexes.is_empty() {
            return 0;
        }

        let expired: Vec<u64> = self
            .docs
            .iter()
            .filter(|(_, doc)| {
                ttl_indexes.iter().any(|(field, ttl)| {
                    expires_at(get_path(doc, field), *ttl).is_some_and(|at| at <= now)
                })
            })
            .map(|(seq, _)| *seq)
            .collect();
        self.remove(&expired)
    }
}

/// Expiry instant of a TTL-indexed value. Non-timestamps never expire.
fn expires_at(value: Option<&Value>, ttl: u64) -> Option<DateTime<Utc>> {
    let ts = match value? {
        Value::String(s) => parse_timestamp(s).ok()?,
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0)?,
        _ => return None,
    };
    Some(ts + chrono::Duration::seconds(ttl as i64))
}

// =============================================================================
// Scopes and Transactions
// =============================================================================

/// Snapshot state of an open transaction.
#[derive(Debug)]
pub struct TxState {
    snapshot: Collections,
    base_versions: HashMap<String, u64>,
    touched: HashSet<String>,
    finished: bool,
}

/// Where an operation reads and writes.
#[derive(Debug, Clone)]
pub enum Scope {
    Live,
    Transaction(Arc<Mutex<TxState>>),
}

fn poisoned<T>(_: T) -> Error {
    Error::Other(anyhow::anyhow!("document engine lock poisoned"))
}

// =============================================================================
// Document Engine
// =============================================================================

/// The document engine shared by a [`NativeDatabase`](super::NativeDatabase).
#[derive(Debug, Default)]
pub struct DocumentEngine {
    collections: RwLock<Collections>,
}

impl DocumentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, scope: &Scope, name: &str, f: impl FnOnce(&CollectionData) -> R) -> Result<R> {
        let empty = CollectionData::default();
        match scope {
            Scope::Live => {
                let collections = self.collections.read().map_err(poisoned)?;
                Ok(f(collections.get(name).unwrap_or(&empty)))
            }
            Scope::Transaction(tx) => {
                let tx = tx.lock().map_err(poisoned)?;
                if tx.finished {
                    return Err(Error::TransactionClosed);
                }
                Ok(f(tx.snapshot.get(name).unwrap_or(&empty)))
            }
        }
    }

    fn write<R>(
        &self,
        scope: &Scope,
        name: &str,
        f: impl FnOnce(&mut CollectionData) -> Result<R>,
    ) -> Result<R> {
        match scope {
            Scope::Live => {
                let mut collections = self.collections.write().map_err(poisoned)?;
                f(collections.entry(name.to_string()).or_default())
            }
            Scope::Transaction(tx) => {
                let mut tx = tx.lock().map_err(poisoned)?;
                if tx.finished {
                    return Err(Error::TransactionClosed);
                }
                tx.touched.insert(name.to_string());
                f(tx.snapshot.entry(name.to_string()).or_default())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Collection Management
    // -------------------------------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(name.to_string()).or_default();
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        Ok(collections.remove(name).is_some())
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    // -------------------------------------------------------------------------
    // Document Operations
    // -------------------------------------------------------------------------

    pub fn insert(&self, scope: &Scope, name: &str, doc: Map) -> Result<DocId> {
        self.write(scope, name, |c| c.insert(doc))
    }

    /// Insert a batch atomically.
    pub fn insert_many(&self, scope: &Scope, name: &str, docs: Vec<Map>) -> Result<Vec<DocId>> {
        self.write(scope, name, |c| {
            let mut staged = c.clone();
            let ids = docs
                .into_iter()
                .map(|doc| staged.insert(doc))
                .collect::<Result<Vec<_>>>()?;
            *c = staged;
            Ok(ids)
        })
    }

    pub fn find(&self, scope: &Scope, name: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Map>> {
        self.read(scope, name, |c| c.find(filter, options))
    }

    pub fn count(&self, scope: &Scope, name: &str, filter: &Filter) -> Result<u64> {
        self.read(scope, name, |c| c.matching(filter).len() as u64)
    }

    pub fn update(
        &self,
        scope: &Scope,
        name: &str,
        filter: &Filter,
        update: &Update,
        many: bool,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.write(scope, name, |c| {
            let mut staged = c.clone();
            let result = staged.update(filter, update, many, upsert)?;
            *c = staged;
            Ok(result)
        })
    }

    pub fn replace_one(&self, scope: &Scope, name: &str, filter: &Filter, doc: Map) -> Result<UpdateResult> {
        self.write(scope, name, |c| c.replace_one(filter, doc))
    }

    pub fn delete(&self, scope: &Scope, name: &str, filter: &Filter, many: bool) -> Result<u64> {
        self.write(scope, name, |c| Ok(c.delete(filter, many)))
    }

    // -------------------------------------------------------------------------
    // Index Operations
    // -------------------------------------------------------------------------

    pub fn create_index(&self, scope: &Scope, name: &str, index: &Index) -> Result<String> {
        self.write(scope, name, |c| c.create_index(index))
    }

    pub fn list_indexes(&self, scope: &Scope, name: &str) -> Result<Vec<Index>> {
        self.read(scope, name, |c| {
            let mut indexes = vec![Index::identity()];
            indexes.extend(c.indexes.iter().cloned());
            indexes
        })
    }

    pub fn drop_index(&self, scope: &Scope, name: &str, index_name: &str) -> Result<()> {
        self.write(scope, name, |c| c.drop_index(index_name))
    }

    /// Remove documents whose TTL has passed, across all collections.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        Ok(collections.values_mut().map(|c| c.expire(now)).sum())
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Start a snapshot transaction.
    pub fn begin(&self) -> Result<Scope> {
        let collections = self.collections.read().map_err(poisoned)?;
        let base_versions = collections
            .iter()
            .map(|(name, c)| (name.clone(), c.version))
            .collect();
        Ok(Scope::Transaction(Arc::new(Mutex::new(TxState {
            snapshot: collections.clone(),
            base_versions,
            touched: HashSet::new(),
            finished: false,
        }))))
    }

    /// Publish the transaction's writes, failing if another writer changed a
    /// collection it touched.
    pub fn commit(&self, scope: &Scope) -> Result<()> {
        let Scope::Transaction(tx) = scope else {
            return Ok(());
        };
        let mut guard = tx.lock().map_err(poisoned)?;
        let tx = &mut *guard;
        if tx.finished {
            return Err(Error::TransactionClosed);
        }
        tx.finished = true;

        let mut collections = self.collections.write().map_err(poisoned)?;
        for name in &tx.touched {
            let live = collections.get(name).map(|c| c.version).unwrap_or(0);
            let base = tx.base_versions.get(name).copied().unwrap_or(0);
            if live != base {
                return Err(Error::TransactionConflict(format!(
                    "collection {} was modified concurrently",
                    name
                )));
            }
        }
        for name in &tx.touched {
            if let Some(mut data) = tx.snapshot.remove(name) {
                let live = collections.get(name).map(|c| c.version).unwrap_or(0);
                data.version = data.version.max(live) + 1;
                collections.insert(name.clone(), data);
            }
        }
        Ok(())
    }

    pub fn rollback(&self, scope: &Scope) -> Result<()> {
        let Scope::Transaction(tx) = scope else {
            return Ok(());
        };
        let mut tx = tx.lock().map_err(poisoned)?;
        if tx.finished {
            return Err(Error::TransactionClosed);
        }
        tx.finished = true;
        tx.snapshot.clear();
        Ok(())
    }
}
