//! SQLite storage for finished calls, their transcripts and the contacts
//! that took part in them.
//!
//! Connections come from an `r2d2` pool; blocking database work runs on
//! tokio's blocking pool so callers stay async.

mod manager;
mod migrations;
mod models;
mod pool;

pub use manager::DatabaseManager;
pub use migrations::{MigrationError, run_migrations};
pub use models::{CallRecord, Contact, Transcription};
pub use pool::{DbPool, DbRuntimeSettings, PoolError, create_pool};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to get a database connection: {0}")]
    Connection(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("failed to encode transcript: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    #[error("database task failed: {0}")]
    Task(String),
}
