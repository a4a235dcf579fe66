//! Error taxonomy for the production pipeline.
//!
//! Two tiers: `WriterError` covers the generator boundary (transient upstream
//! failures vs invalid content), `FactoryError` is everything the control
//! plane can observe. Best-effort subsystems (RAG indexing, consistency
//! reporting, beat recording) do NOT get a variant here: their failures are
//! logged and never propagate past the worker.

use std::time::Duration;
use thiserror::Error;

/// Failures at the generator boundary.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("generator returned an empty body")]
    Empty,

    #[error("generator output looks truncated: {0}")]
    Truncated(String),

    #[error("chapter title line missing or unparsable")]
    TitleUnparsable,

    #[error("generator upstream failure: {0}")]
    Upstream(String),

    #[error("generator call timed out after {0:?}")]
    Timeout(Duration),
}

impl WriterError {
    /// Transient errors get the bounded retry inside the writer; content
    /// errors are routed straight to the rewriter as a hard gate failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriterError::Upstream(_) | WriterError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("project '{0}' has no outline")]
    OutlineMissing(String),

    #[error("project '{0}' already has all planned chapters")]
    AlreadyComplete(String),

    #[error("a session for project '{0}' is already running")]
    SessionBusy(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("chapter {chapter} failed after {attempts} attempts: {reason}")]
    ChapterWriteFailed {
        chapter: i64,
        attempts: u32,
        reason: String,
    },

    #[error("factory flag '{0}' is disabled")]
    Disabled(&'static str),

    #[error("config error: {0}")]
    Config(String),
}

pub type FactoryResult<T> = Result<T, FactoryError>;

/// Detects "database is locked" (SQLite code 5). Locked writes are the one
/// store error class worth retrying with backoff.
pub fn is_sqlite_locked(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("5")
                || db.message().to_lowercase().contains("database is locked")
        }
        _ => e.to_string().to_lowercase().contains("database is locked"),
    }
}
