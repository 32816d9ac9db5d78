//! docbridge CLI
//!
//! Command-line interface for inspecting and editing docbridge stores.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use docbridge_core::Backend;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "docbridge")]
#[command(author, version, about = "Document stores over SQLite or a native engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend to open; `document` starts an empty in-memory engine per command
    #[arg(short, long, global = true, value_enum, default_value = "sqlite")]
    backend: BackendArg,

    /// Database path (SQLite backend)
    #[arg(short, long, global = true, default_value = ".docbridge/store.db")]
    database: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    /// SQLite file at --database
    Sqlite,
    /// In-memory document engine, discarded when the command exits
    Document,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Sqlite => Backend::Sqlite,
            BackendArg::Document => Backend::Document,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the store is reachable
    Ping,

    /// List collections
    Collections,

    /// Count documents in a collection
    Count {
        collection: String,

        /// Filter document as JSON
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Print matching documents
    Find {
        collection: String,

        /// Filter document as JSON
        #[arg(short, long)]
        filter: Option<String>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: u64,

        /// Sort key as field or field:-1
        #[arg(short, long)]
        sort: Vec<String>,
    },

    /// Insert one JSON document
    Insert {
        collection: String,

        /// Document as JSON
        document: String,
    },

    /// List indexes of a collection
    Indexes { collection: String },

    /// Create an index
    CreateIndex {
        collection: String,

        /// Index key as field or field:-1 (repeatable)
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,

        /// Index name (derived from the keys by default)
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long)]
        unique: bool,

        #[arg(long)]
        sparse: bool,

        /// Expire documents this many seconds after the indexed time
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Drop a collection
    Drop { collection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("docbridge=debug,docbridge_core=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("docbridge=warn,docbridge_core=warn")
            .init();
    }

    let store = commands::StoreArgs {
        backend: cli.backend.into(),
        database: cli.database,
    };

    match cli.command {
        Commands::Ping => commands::collections::ping(&store).await?,
        Commands::Collections => commands::collections::list(&store).await?,
        Commands::Count { collection, filter } => {
            commands::documents::count(&store, &collection, filter.as_deref()).await?;
        }
        Commands::Find {
            collection,
            filter,
            limit,
            sort,
        } => {
            commands::documents::find(&store, &collection, filter.as_deref(), limit, &sort).await?;
        }
        Commands::Insert {
            collection,
            document,
        } => {
            commands::documents::insert(&store, &collection, &document).await?;
        }
        Commands::Indexes { collection } => commands::indexes::list(&store, &collection).await?,
        Commands::CreateIndex {
            collection,
            keys,
            name,
            unique,
            sparse,
            ttl,
        } => {
            let options = commands::indexes::IndexArgs {
                keys,
                name,
                unique,
                sparse,
                ttl,
            };
            commands::indexes::create(&store, &collection, options).await?;
        }
        Commands::Drop { collection } => commands::collections::drop(&store, &collection).await?,
    }

    Ok(())
}
