//! SQLite database handle and transactions.

use super::ann::AnnRegistry;
use super::collection::{load_index_specs, SqliteCollection};
use super::schema::{self, path_literal, quote_ident, table_exists, table_name, INDEX_META_TABLE};
use super::session::Session;
use super::functions;
use crate::config::{Backend, StoreConfig};
use crate::document::format_timestamp;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::storage::sweeper::Sweeper;
use crate::storage::traits::{Collection, Database, Transaction};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, InterruptHandle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// SQLite-backed document database.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    ann: Arc<AnnRegistry>,
    config: StoreConfig,
    sweeper: Sweeper,
    closed: Arc<AtomicBool>,
}

impl SqliteDatabase {
    /// Open the database described by `config` and prepare its metadata.
    pub async fn connect(config: &StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let path = config.path.clone();
        let busy_timeout = std::time::Duration::from_millis(config.busy_timeout_ms);

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = match &path {
                Some(path) => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent)?;
                    }
                    Connection::open(path)
                }
                None => Connection::open_in_memory(),
            }
            .map_err(|e| Error::Connection(format!("failed to open database: {}", e)))?;

            conn.busy_timeout(busy_timeout)?;
            if path.is_some() {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            }
            functions::register(&conn)?;
            schema::init_metadata(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Connection(format!("open task failed: {}", e)))??;

        let db = Arc::new(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
            ann: Arc::new(AnnRegistry::default()),
            config: config.clone(),
            sweeper: Sweeper::default(),
            closed: Arc::new(AtomicBool::new(false)),
        });
        if let Some(interval) = config.ttl_sweep_interval() {
            let as_dyn: Arc<dyn Database> = db.clone();
            let weak: Weak<dyn Database> = Arc::downgrade(&as_dyn);
            db.sweeper.start(weak, interval);
        }

        match &config.path {
            Some(path) => tracing::info!("opened SQLite database at {}", path.display()),
            None => tracing::info!("opened in-memory SQLite database"),
        }
        Ok(db)
    }

    /// In-memory database with default settings.
    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::connect(&StoreConfig::sqlite_in_memory()).await
    }

    /// File-backed database with default settings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::connect(&StoreConfig::sqlite(path)).await
    }

    fn shared_session(&self) -> Session {
        Session::shared(
            self.conn.clone(),
            self.interrupt.clone(),
            self.config.op_timeout(),
            self.closed.clone(),
        )
    }

    /// Concrete collection handle, exposing the vector extension.
    pub fn sqlite_collection(&self, name: &str) -> SqliteCollection {
        SqliteCollection::new(
            self.shared_session(),
            self.ann.clone(),
            name,
            self.config.cursor_batch_size,
        )
    }

    /// Start a transaction with its concrete type.
    pub async fn begin_sqlite(&self) -> Result<Arc<SqliteTransaction>> {
        self.ensure_open()?;
        let session = self.shared_session().begin().await?;
        Ok(Arc::new(SqliteTransaction {
            session,
            ann: self.ann.clone(),
            batch_size: self.config.cursor_batch_size,
        }))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("database is closed".to_string()));
        }
        Ok(())
    }
}

/// Soft-delete rows whose TTL field is older than `ttl` seconds.
fn expire_index(conn: &Connection, collection: &str, index: &Index, now: chrono::DateTime<Utc>) -> Result<u64> {
    let (Some(ttl), Some(key)) = (index.ttl, index.keys.first()) else {
        return Ok(0);
    };
    let table = table_name(collection)?;
    if !table_exists(conn, &table)? {
        return Ok(0);
    }
    let cutoff = now - chrono::Duration::seconds(ttl as i64);
    let path = path_literal(&key.field)?;
    let sql = format!(
        "UPDATE {table} SET _deleted_at = ?1 WHERE _deleted_at IS NULL AND ( \
         (json_type(data, {p}) = 'text' AND julianday(json_extract(data, {p})) <= julianday(?2)) \
         OR (json_type(data, {p}) IN ('integer', 'real') AND json_extract(data, {p}) <= ?3))",
        table = quote_ident(&table),
        p = path
    );
    let n = conn.execute(
        &sql,
        params![format_timestamp(&now), format_timestamp(&cutoff), cutoff.timestamp()],
    )?;
    Ok(n as u64)
}

#[async_trait]
impl Database for SqliteDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(self.sqlite_collection(name))
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared_session()
            .run("ping", |conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await
    }

    /// Stop the sweeper, refuse further calls and release the connection.
    ///
    /// The connection is released once in-flight calls and any open
    /// transaction let go of it, waiting at most the operation deadline.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sweeper.stop();

        let timeout = self.config.op_timeout();
        let mut guard = tokio::time::timeout(timeout, self.conn.clone().lock_owned())
            .await
            .map_err(|_| Error::Cancelled(format!("close exceeded deadline of {:?}", timeout)))?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if !guard.is_autocommit() {
                guard.execute_batch("ROLLBACK")?;
            }
            let released = std::mem::replace(&mut *guard, Connection::open_in_memory()?);
            released.close().map_err(|(_, e)| Error::from(e))
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("close task failed: {}", e)))??;
        tracing::info!("SQLite database closed");
        Ok(())
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        let table = table_name(name)?;
        self.shared_session()
            .run("create_collection", move |conn| schema::ensure_table(conn, &table))
            .await
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = name.to_string();
        let dropped = self
            .shared_session()
            .run("drop_collection", move |conn| schema::drop_collection(conn, &collection))
            .await?;
        if dropped {
            tracing::info!("dropped collection {}", name);
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.shared_session()
            .run("list_collections", |conn| schema::list_collections(conn))
            .await
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>> {
        let tx: Arc<dyn Transaction> = self.begin_sqlite().await?;
        Ok(tx)
    }

    async fn sweep_expired(&self) -> Result<u64> {
        self.shared_session()
            .run("sweep_expired", |conn| {
                let collections: Vec<String> = {
                    let mut stmt =
                        conn.prepare(&format!("SELECT DISTINCT collection FROM {}", INDEX_META_TABLE))?;
                    let rows = stmt
                        .query_map([], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                let now = Utc::now();
                let sp = conn.savepoint()?;
                let mut expired = 0;
                for collection in collections {
                    for (index, _) in load_index_specs(&sp, &collection)? {
                        expired += expire_index(&sp, &collection, &index, now)?;
                    }
                }
                sp.commit()?;
                Ok(expired)
            })
            .await
    }
}

/// A transaction holding the connection until commit or rollback.
pub struct SqliteTransaction {
    session: Session,
    ann: Arc<AnnRegistry>,
    batch_size: usize,
}

impl SqliteTransaction {
    /// Concrete collection handle bound to this transaction.
    pub fn sqlite_collection(&self, name: &str) -> SqliteCollection {
        SqliteCollection::new(self.session.clone(), self.ann.clone(), name, self.batch_size)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(self.sqlite_collection(name))
    }

    async fn commit(&self) -> Result<()> {
        self.session.finish(true).await
    }

    async fn rollback(&self) -> Result<()> {
        self.session.finish(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::storage::traits::CollectionExt;
    use crate::testutils::{test_sqlite, TestFixtures};
    use serde_json::json;

    fn doc(value: serde_json::Value) -> crate::json::Map {
        TestFixtures::doc(value)
    }

    #[tokio::test]
    async fn test_ttl_sweep_soft_deletes() {
        let db = test_sqlite().await;
        let sessions = db.collection("sessions");
        sessions
            .create_index(&Index::new().asc("expires").ttl(60))
            .await
            .unwrap();
        sessions
            .insert_one(doc(json!({"user": "old", "expires": "2000-01-01T00:00:00.000Z"})))
            .await
            .unwrap();
        sessions
            .insert_one(doc(json!({"user": "epoch", "expires": 1})))
            .await
            .unwrap();
        sessions
            .insert_one(doc(json!({"user": "fresh", "expires": format_timestamp(&Utc::now())})))
            .await
            .unwrap();

        assert_eq!(db.sweep_expired().await.unwrap(), 2);
        assert_eq!(sessions.count_documents(&Filter::all()).await.unwrap(), 1);
        let concrete = db.sqlite_collection("sessions");
        assert_eq!(concrete.count_including_deleted(&Filter::all()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let db = test_sqlite().await;
        let tx = db.begin().await.unwrap();
        tx.collection("items").insert_one(doc(json!({"n": 1}))).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.collection("items").count_documents(&Filter::all()).await.unwrap(), 0);

        let tx = db.begin().await.unwrap();
        let id = tx.collection("items").insert_one(doc(json!({"n": 2}))).await.unwrap();
        tx.commit().await.unwrap();
        assert!(db.collection("items").find_by_id(&id).await.is_ok());
        assert!(matches!(tx.commit().await, Err(Error::TransactionClosed)));
    }

    #[tokio::test]
    async fn test_close_rejects_collection_calls() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let db = SqliteDatabase::open(&path).await.unwrap();
        let items = db.collection("items");
        items.insert_one(doc(json!({"n": 1}))).await.unwrap();

        db.close().await.unwrap();
        db.close().await.unwrap();
        assert!(matches!(db.ping().await, Err(Error::Connection(_))));
        assert!(matches!(
            items.count_documents(&Filter::all()).await,
            Err(Error::Connection(_))
        ));
        assert!(matches!(db.begin().await, Err(Error::Connection(_))));

        let reopened = SqliteDatabase::open(&path).await.unwrap();
        assert_eq!(
            reopened.collection("items").count_documents(&Filter::all()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let db = test_sqlite().await;
        {
            let tx = db.begin().await.unwrap();
            tx.collection("items").insert_one(doc(json!({"n": 1}))).await.unwrap();
        }
        assert_eq!(db.collection("items").count_documents(&Filter::all()).await.unwrap(), 0);
    }
}
