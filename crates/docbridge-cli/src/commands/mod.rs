//! CLI subcommands.

pub mod collections;
pub mod documents;
pub mod indexes;

use anyhow::{Context, Result};
use colored::Colorize;
use docbridge_core::{connect, Backend, Database, Filter, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Store selection shared by every subcommand.
pub struct StoreArgs {
    pub backend: Backend,
    pub database: PathBuf,
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        match self.backend {
            Backend::Sqlite => StoreConfig::sqlite(&self.database),
            Backend::Document => StoreConfig::document(),
        }
    }

    /// Whether the store's contents vanish when the command exits.
    pub fn is_ephemeral(&self) -> bool {
        self.config().path.is_none()
    }

    /// Open the selected store.
    pub async fn open(&self) -> Result<Arc<dyn Database>> {
        let config = self.config();
        tracing::debug!("opening {} store", config.backend.as_str());
        if self.is_ephemeral() {
            eprintln!(
                "{}",
                "note: the document backend is in-memory; nothing is kept after this command".yellow()
            );
        }
        connect(&config)
            .await
            .with_context(|| format!("failed to open {} store", config.backend.as_str()))
    }
}

/// Parse an optional JSON filter document.
pub fn parse_filter(filter: Option<&str>) -> Result<Filter> {
    match filter {
        Some(text) => {
            let value: serde_json::Value =
                serde_json::from_str(text).context("filter is not valid JSON")?;
            Ok(Filter::from_value(&value)?)
        }
        None => Ok(Filter::all()),
    }
}
