//! Store configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which storage backend a store runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Relational backend: SQLite with a JSON payload column
    #[default]
    Sqlite,
    /// Native document engine
    Document,
}

impl Backend {
    /// Get the backend name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Document => "document",
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "relational" | "sql" => Ok(Backend::Sqlite),
            "document" | "native" | "memory" => Ok(Backend::Document),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Connection settings for a store.
///
/// Loading these from files or the environment is the caller's concern;
/// the CLI fills them from its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to connect to
    pub backend: Backend,
    /// Database file; `None` keeps the SQLite database in memory
    pub path: Option<PathBuf>,
    /// Deadline applied to every operation, in milliseconds
    pub op_timeout_ms: u64,
    /// SQLite busy timeout, in milliseconds
    pub busy_timeout_ms: u64,
    /// Interval of the background TTL sweeper; `None` disables it
    pub ttl_sweep_interval_secs: Option<u64>,
    /// Rows fetched per cursor round trip
    pub cursor_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: None,
            op_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            ttl_sweep_interval_secs: None,
            cursor_batch_size: 100,
        }
    }
}

impl StoreConfig {
    /// SQLite store backed by a file.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// SQLite store kept in memory (for testing).
    pub fn sqlite_in_memory() -> Self {
        Self::default()
    }

    /// Native document engine store.
    pub fn document() -> Self {
        Self {
            backend: Backend::Document,
            ..Self::default()
        }
    }

    /// Set the per-operation deadline.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable the background TTL sweeper.
    pub fn with_ttl_sweep(mut self, interval: Duration) -> Self {
        self.ttl_sweep_interval_secs = Some(interval.as_secs().max(1));
        self
    }

    /// Set the cursor batch size.
    pub fn with_cursor_batch_size(mut self, size: usize) -> Self {
        self.cursor_batch_size = size;
        self
    }

    /// Per-operation deadline.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Sweeper interval, if enabled.
    pub fn ttl_sweep_interval(&self) -> Option<Duration> {
        self.ttl_sweep_interval_secs.map(Duration::from_secs)
    }

    /// Reject settings no backend can run with.
    pub fn validate(&self) -> Result<()> {
        if self.op_timeout_ms == 0 {
            return Err(Error::Config("op_timeout_ms must be positive".to_string()));
        }
        if self.cursor_batch_size == 0 {
            return Err(Error::Config(
                "cursor_batch_size must be positive".to_string(),
            ));
        }
        if self.ttl_sweep_interval_secs == Some(0) {
            return Err(Error::Config(
                "ttl_sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
