//! Persistence for datasets, sessions, anomalies and reports.
//!
//! [`Store`] is the narrow interface the state machine writes through. Every
//! mutating method is a single conditional operation: the check and the
//! write happen under one transaction (SQLite) or one lock (memory).

pub mod memory;
pub mod schema;
pub mod sqlite;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use uuid::Uuid;

use crate::classify::DetectedAnomaly;
use crate::report::AnomalyReport;
use crate::session::{AnalysisSession, Dataset, DatasetStatus, SessionStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset {0} already exists")]
    DuplicateDataset(Uuid),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result of an atomic check-and-create.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Created(AnalysisSession),
    /// A non-terminal session already existed; nothing was written.
    Existing(AnalysisSession),
    DatasetNotFound,
    /// The dataset cannot move to `Analyzing` from its current status.
    DatasetBlocked(DatasetStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressOutcome {
    Applied(AnalysisSession),
    /// Lower than the stored progress; dropped.
    Stale(AnalysisSession),
    /// The session is terminal; nothing was written.
    Terminal(AnalysisSession),
    NotFound,
}

/// Results written together with a `Completed` transition.
#[derive(Debug, Clone)]
pub struct SessionResults {
    pub report: AnomalyReport,
    pub anomalies: Vec<DetectedAnomaly>,
}

/// One status change, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct SessionTransition {
    pub session_id: Uuid,
    pub to: SessionStatus,
    pub dataset_to: Option<DatasetStatus>,
    pub error_message: Option<String>,
    pub results: Option<SessionResults>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(AnalysisSession),
    /// The transition table forbids `session.status -> to`.
    Rejected(AnalysisSession),
    /// The owning dataset cannot take the requested status.
    DatasetRejected(DatasetStatus),
    NotFound,
}

/// Record store behind the session state machine.
pub trait Store: Send + Sync {
    fn insert_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    fn dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError>;

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError>;

    fn session(&self, id: Uuid) -> Result<Option<AnalysisSession>, StoreError>;

    /// Sessions of a dataset, oldest first.
    fn sessions_for_dataset(&self, dataset_id: Uuid) -> Result<Vec<AnalysisSession>, StoreError>;

    /// Insert `session` and move its dataset to `Analyzing`, unless the
    /// dataset already has a non-terminal session.
    fn create_session_if_idle(&self, session: AnalysisSession) -> Result<StartOutcome, StoreError>;

    fn record_progress(&self, session_id: Uuid, percent: u8) -> Result<ProgressOutcome, StoreError>;

    fn transition_session(&self, change: SessionTransition) -> Result<TransitionOutcome, StoreError>;

    fn report(&self, session_id: Uuid) -> Result<Option<AnomalyReport>, StoreError>;

    /// Non-Benign anomalies of a session in sample order.
    fn anomalies(&self, session_id: Uuid) -> Result<Vec<DetectedAnomaly>, StoreError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let mut conn = pool.get()?;
    schema::migrate(&mut conn)?;

    Ok(pool)
}
