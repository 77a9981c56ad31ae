// src/error.rs

//! Crate-wide error type
//!
//! One variant per error *kind* from the taxonomy in the spec's error
//! handling section, not one per call site. Callers that need to branch on
//! the SQLite failure class (busy/locked/full/io) use the `is_busy`,
//! `is_full`, and `is_io` helpers rather than matching on
//! `rusqlite::Error` directly, so the classification lives in one place.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Wrapped SQLite error. Use `is_busy`/`is_full`/`is_io` to classify.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blob's content failed the bounded-window integrity check after
    /// being copied into place.
    #[error("integrity check failed for blob {uid}: {reason}")]
    IntegrityCheck { uid: String, reason: String },

    /// Disk is full and a synchronous `force_gc` + single retry also failed.
    #[error("storage full: could not reclaim enough space for this request")]
    StorageFull,

    /// Declared bound-parameter set for a prepared statement does not match
    /// what the caller will bind, or the DDL's column count drifted. Fatal
    /// at construction time.
    #[error("schema drift detected in statement '{statement}': {reason}")]
    SchemaDrift { statement: String, reason: String },

    /// An invariant the authors considered unreachable was violated.
    /// Preserved as a distinct, fail-fast kind rather than a panic so the
    /// host process can decide how to terminate.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("path escapes root: {0}")]
    PathTraversal(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Check a raw `rusqlite::Error` for the busy/locked class without
/// consuming it, for call sites (like match guards) that only hold a
/// borrow.
pub fn sqlite_error_is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl Error {
    /// SQLite reported `BUSY` or `LOCKED` — the caller should retry the
    /// enclosing `BEGIN` under the configured back-off policy.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// SQLite reported `FULL` (disk or memory exhausted for the DB itself).
    pub fn is_full(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::DiskFull
        ) || matches!(self, Error::StorageFull)
    }

    /// SQLite reported `IOERR`, or this is a wrapped `std::io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
            || matches!(
                self,
                Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::SystemIoFailure
            )
    }
}
