//! Structured error taxonomy shared across the database, resolver, planner,
//! isolation, and orchestrator modules (component G).

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the build database (component A).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("validation error during {op}: {reason}")]
    Validation { op: &'static str, reason: String },

    #[error("build record not found: {uuid}")]
    RecordNotFound { uuid: String },

    #[error("keyspace not initialized: {name}")]
    BucketNotFound { name: &'static str },

    #[error("record {uuid} could not be deserialized: {reason}")]
    CorruptedData { uuid: String, reason: String },

    #[error("latest-success index for {port_dir}@{version} points at missing record {uuid}")]
    OrphanedRecord {
        port_dir: String,
        version: String,
        uuid: String,
    },
}

impl DbError {
    pub fn database(op: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        DbError::Database {
            op,
            source: Box::new(source),
        }
    }
}

/// Errors from the abstract isolation environment contract (component E).
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("isolation setup failed during {op}: {underlying}")]
    Failed { op: &'static str, underlying: String },
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command '{cmd}' failed during {op}: {underlying}")]
    Failed {
        op: &'static str,
        cmd: String,
        underlying: String,
    },
    #[error("command '{cmd}' timed out during {op}")]
    Timeout { op: &'static str, cmd: String },
    #[error("command '{cmd}' cancelled during {op}")]
    Cancelled { op: &'static str, cmd: String },
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("cleanup failed during {op}: {underlying}")]
    Failed { op: &'static str, underlying: String },
    #[error("process-tree reap of worker {worker_id} did not complete within the grace window")]
    ReapTimedOut { worker_id: usize },
}

/// Cycle detection failure from the strict topological sort (component C).
#[derive(Debug, Error)]
#[error("dependency cycle detected among {} of {total_packages} packages", cycle_packages.len())]
pub struct CycleError {
    pub total_packages: usize,
    pub ordered_packages: Vec<String>,
    pub cycle_packages: Vec<String>,
}

/// Errors from the build planner's fingerprinting pass (component D/H).
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("fingerprint hashing failed for {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error while planning {port_dir}: {source}")]
    Database {
        port_dir: String,
        #[source]
        source: DbError,
    },
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("port source directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error type threading every component's failures through the
/// orchestrator and CLI boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("configuration error: {0}")]
    Config(String),
}
