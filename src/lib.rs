pub mod backup;
pub mod cache;
pub mod callbacks;
pub mod config;
pub(crate) mod dump;
pub mod pool;
pub mod session;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub use backup::{BackupOptions, BackupProgress};
pub use config::PoolOptions;
pub use session::{Database, DatabaseBuilder, FetchResult, Session};

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "connection pool for {path} exhausted: no connection became available \
         within {timeout:?} (max_size: {max_size})"
    )]
    PoolTimeout {
        path: String,
        timeout: Duration,
        max_size: usize,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("pool configuration cannot change after connections have been created")]
    PoolFrozen,

    #[error("invalid database path: {0}")]
    InvalidPath(String),

    #[error("transaction already in progress on session {session}")]
    AlreadyActive { session: Uuid },

    #[error("no transaction in progress on session {session}")]
    NoActiveTransaction { session: Uuid },

    #[error("connection for session {session} missing from its {slot} slot")]
    ConnectionMissing { session: Uuid, slot: &'static str },

    #[error("backup target session {session} has an active transaction")]
    TargetBusy { session: Uuid },

    #[error(
        "source and target handles come from different SQLite library instances \
         ({source_instance:#x} vs {target_instance:#x})"
    )]
    HandleIncompatible {
        source_instance: usize,
        target_instance: usize,
    },

    #[error("backup cancelled after copying {pages_copied} pages")]
    BackupCancelled { pages_copied: i64 },

    #[error("backup step failed after copying {pages_copied} pages: {source}")]
    BackupStep {
        pages_copied: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to open database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("blocking worker failed: {0}")]
    Worker(String),

    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl Error {
    /// Wrap an engine error with the operation that triggered it and,
    /// when permitted, the query text.
    pub(crate) fn engine(operation: &str, query: Option<&str>, source: rusqlite::Error) -> Self {
        let context = match query {
            Some(sql) => format!("{operation} (`{sql}`)"),
            None => operation.to_string(),
        };
        Error::Engine { context, source }
    }

    /// The underlying SQLite error, if this error wraps one.
    pub fn sqlite_error(&self) -> Option<&rusqlite::Error> {
        match self {
            Error::Engine { source, .. }
            | Error::Open { source, .. }
            | Error::BackupStep { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolTimeout { .. } | Error::TargetBusy { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
