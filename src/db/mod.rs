//! SQLite persistence for experiments, run groups, runs and their logs.

pub mod runs;

use thiserror::Error;

pub use runs::{
    ExperimentRecord, RunGroupGuard, RunGroupRecord, RunLogRecord, RunRecord, RunStatus, RunStore,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}
