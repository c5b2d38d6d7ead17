//! anomalytriage -- cost-calibrated anomaly thresholds and triage sessions.
//!
//! This crate turns per-sample anomaly scores into a threshold, severity
//! classifications and a ranked triage report, tracked through a durable
//! dataset/session lifecycle.

pub mod calibrate;
pub mod classify;
pub mod config;
pub mod error;
pub mod ingest;
pub mod oracle;
pub mod report;
pub mod session;
pub mod storage;

use std::sync::Arc;

pub use error::{Result, TriageError};

use config::{StorageBackend, StorageConfig};
use storage::{MemoryStore, SqliteStore, Store, StoreError};

/// Open the store selected by `config`, creating the database directory if needed.
pub fn open_store(config: &StorageConfig) -> std::result::Result<Arc<dyn Store>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            if let Some(parent) = config.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let path = config.db_path.to_string_lossy();
            tracing::info!(db_path = %path, "Opening database");
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}
