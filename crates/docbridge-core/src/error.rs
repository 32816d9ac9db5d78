//! Error types for docbridge.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// docbridge error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend could not be opened or reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Database error, passed through from the SQLite driver
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A single-document lookup matched nothing
    #[error("no documents in result")]
    NoDocuments,

    /// Unique index violation raised by the document engine
    #[error("Duplicate key on index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    /// Filter operator the backend cannot translate
    #[error("Unsupported filter operator on {backend} backend: {operator}")]
    UnsupportedFilter {
        backend: &'static str,
        operator: String,
    },

    /// Malformed filter document
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Malformed update document
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Malformed or conflicting index specification
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// Collection or field name that cannot be used as an identifier
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Identity that is neither a hex document id nor a UUID
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Vector field, dimension or index error
    #[error("Vector error: {0}")]
    Vector(String),

    /// Snapshot transaction lost a write race
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Transaction already committed or rolled back
    #[error("Transaction already finished")]
    TransactionClosed,

    /// Cursor used after close
    #[error("Cursor is closed")]
    CursorClosed,

    /// Deadline passed or caller dropped the call
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the "no documents" condition of single-document lookups.
    pub fn is_no_documents(&self) -> bool {
        matches!(self, Error::NoDocuments)
    }

    /// True when the call was cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Classify unique-key violations from either backend.
    ///
    /// The SQLite error is not rewrapped; this only inspects it.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Error::DuplicateKey { .. } => true,
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
                    && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
            }
            _ => false,
        }
    }

    /// Map an interrupted SQLite statement to [`Error::Cancelled`].
    pub(crate) fn classify_interrupt(self) -> Self {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                Error::Cancelled("statement interrupted".to_string())
            }
            other => other,
        }
    }
}
