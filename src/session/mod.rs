//! Dataset and analysis-session lifecycle.
//!
//! Status values are closed enums with an explicit transition table. Every
//! write through the store re-checks the table, so an invalid transition is
//! rejected instead of persisted.

pub mod machine;
pub mod runner;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use machine::{ProgressUpdate, SessionStateMachine, Started};
pub use runner::{AnalysisRequest, AnalysisRunner, ScoreSource};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("dataset {0} not found")]
    DatasetNotFound(Uuid),

    #[error("session {id} is already {status}")]
    TerminalSession { id: Uuid, status: SessionStatus },

    #[error("invalid transition for session {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("dataset {id} cannot start analysis while {status}")]
    DatasetBusy { id: Uuid, status: DatasetStatus },

    #[error("session {session} cannot move its dataset from {from} to {to}")]
    DatasetTransition {
        session: Uuid,
        from: DatasetStatus,
        to: DatasetStatus,
    },

    #[error("report for session {report} cannot complete session {session}")]
    ReportMismatch { session: Uuid, report: Uuid },

    #[error("session {id} is {status}; a report exists only once Completed")]
    NotCompleted { id: Uuid, status: SessionStatus },
}

/// Dataset lifecycle: `Uploaded -> Analyzing -> {Analyzed, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetStatus {
    Uploaded,
    Analyzing,
    Analyzed,
    Error,
}

impl DatasetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DatasetStatus::Analyzed | DatasetStatus::Error)
    }

    /// A terminal dataset may only re-enter `Analyzing` through a new session.
    pub fn can_transition_to(self, to: DatasetStatus) -> bool {
        use DatasetStatus::*;
        matches!(
            (self, to),
            (Uploaded, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzing, Error)
                | (Analyzed, Analyzing)
                | (Error, Analyzing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetStatus::Uploaded => "Uploaded",
            DatasetStatus::Analyzing => "Analyzing",
            DatasetStatus::Analyzed => "Analyzed",
            DatasetStatus::Error => "Error",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Uploaded" => Ok(DatasetStatus::Uploaded),
            "Analyzing" => Ok(DatasetStatus::Analyzing),
            "Analyzed" => Ok(DatasetStatus::Analyzed),
            "Error" => Ok(DatasetStatus::Error),
            other => Err(format!("unknown dataset status '{}'", other)),
        }
    }
}

/// Session lifecycle: `Pending -> Running -> {Completed, Failed}`, plus
/// `Pending -> Failed` for failures before any scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "Pending",
            SessionStatus::Running => "Running",
            SessionStatus::Completed => "Completed",
            SessionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SessionStatus::Pending),
            "Running" => Ok(SessionStatus::Running),
            "Completed" => Ok(SessionStatus::Completed),
            "Failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub status: DatasetStatus,
    pub uploaded_at: DateTime<Utc>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: DatasetStatus::Uploaded,
            uploaded_at: Utc::now(),
            analyzed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub status: SessionStatus,
    /// 0..=100, never decreasing.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AnalysisSession {
    pub fn pending(dataset_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            status: SessionStatus::Pending,
            progress: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }
}
