//! Error taxonomy shared across the triage pipeline.

use thiserror::Error;

pub use crate::calibrate::CalibrationError;
pub use crate::ingest::ValidationError;
pub use crate::oracle::ScoringUnavailable;
pub use crate::session::StateError;
pub use crate::storage::StoreError;

pub type Result<T> = std::result::Result<T, TriageError>;

/// Invalid caller-supplied parameters. Rejected before any state is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("threshold must be finite and > 0, got {0}")]
    NonPositiveThreshold(f64),

    #[error("invalid cost model: fp_cost={fp_cost}, fn_cost={fn_cost} (both must be finite and > 0)")]
    InvalidCost { fp_cost: f64, fn_cost: f64 },

    #[error("severity tiers must satisfy 1.0 == low < medium < high < critical")]
    InvalidTiers,

    #[error("invalid candidate grid: {0}")]
    InvalidGrid(String),

    #[error("fallback percentile must be in [0, 100), got {0}")]
    InvalidPercentile(f64),
}

/// Any failure surfaced by the triage library.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scoring(#[from] ScoringUnavailable),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("analysis task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
