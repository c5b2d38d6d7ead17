//! The single writer of dataset and session status.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AnalysisSession, Dataset, DatasetStatus, SessionStatus, StateError};
use crate::classify::DetectedAnomaly;
use crate::error::Result;
use crate::report::AnomalyReport;
use crate::storage::{
    ProgressOutcome, SessionResults, SessionTransition, StartOutcome, Store, StoreError,
    TransitionOutcome,
};

/// Message recorded on sessions stopped through [`SessionStateMachine::cancel`].
pub const CANCELLED_MESSAGE: &str = "analysis cancelled";

/// Result of [`SessionStateMachine::start_analysis`].
#[derive(Debug, Clone, PartialEq)]
pub enum Started {
    /// A fresh `Pending` session was created.
    New(AnalysisSession),
    /// The dataset already had a non-terminal session; it is returned as-is.
    Existing(AnalysisSession),
}

impl Started {
    pub fn session(&self) -> &AnalysisSession {
        match self {
            Started::New(s) | Started::Existing(s) => s,
        }
    }

    pub fn into_session(self) -> AnalysisSession {
        match self {
            Started::New(s) | Started::Existing(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Started::New(_))
    }
}

/// Outcome of a progress write that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Applied(u8),
    /// Out-of-order update; the stored value is kept.
    Dropped { current: u8 },
}

const TOKEN_SHARDS: usize = 16;

/// Cancellation tokens keyed by session, split across independently locked
/// shards.
struct TokenRegistry {
    shards: [Mutex<HashMap<Uuid, CancellationToken>>; TOKEN_SHARDS],
}

impl TokenRegistry {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, session_id: Uuid) -> &Mutex<HashMap<Uuid, CancellationToken>> {
        &self.shards[session_id.as_bytes()[0] as usize % TOKEN_SHARDS]
    }

    fn get_or_create(&self, session_id: Uuid) -> CancellationToken {
        self.shard(session_id)
            .lock()
            .entry(session_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn get(&self, session_id: Uuid) -> Option<CancellationToken> {
        self.shard(session_id).lock().get(&session_id).cloned()
    }

    fn remove(&self, session_id: Uuid) {
        self.shard(session_id).lock().remove(&session_id);
    }
}

/// Owns every status field of datasets and sessions.
///
/// All lifecycle writes go through here and down to the injected [`Store`]
/// as single conditional operations.
pub struct SessionStateMachine {
    store: Arc<dyn Store>,
    cancellations: TokenRegistry,
}

impl SessionStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cancellations: TokenRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn register_dataset(&self, name: &str) -> Result<Dataset> {
        let dataset = Dataset::new(name);
        self.store.insert_dataset(&dataset)?;
        info!(dataset_id = %dataset.id, name, "Dataset registered");
        Ok(dataset)
    }

    pub fn dataset(&self, id: Uuid) -> Result<Dataset> {
        Ok(self.store.dataset(id)?.ok_or(StateError::DatasetNotFound(id))?)
    }

    pub fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.store.list_datasets()?)
    }

    pub fn session(&self, id: Uuid) -> Result<AnalysisSession> {
        Ok(self.store.session(id)?.ok_or(StateError::SessionNotFound(id))?)
    }

    pub fn sessions_for_dataset(&self, dataset_id: Uuid) -> Result<Vec<AnalysisSession>> {
        self.dataset(dataset_id)?;
        Ok(self.store.sessions_for_dataset(dataset_id)?)
    }

    pub fn active_session(&self, dataset_id: Uuid) -> Result<Option<AnalysisSession>> {
        Ok(self
            .sessions_for_dataset(dataset_id)?
            .into_iter()
            .find(|s| !s.status.is_terminal()))
    }

    /// Start analysing `dataset_id`, or return the session already doing so.
    pub fn start_analysis(&self, dataset_id: Uuid) -> Result<Started> {
        match self
            .store
            .create_session_if_idle(AnalysisSession::pending(dataset_id))?
        {
            StartOutcome::Created(session) => {
                info!(session_id = %session.id, %dataset_id, "Analysis session created");
                Ok(Started::New(session))
            }
            StartOutcome::Existing(session) => {
                debug!(session_id = %session.id, %dataset_id, status = %session.status, "Reusing active session");
                Ok(Started::Existing(session))
            }
            StartOutcome::DatasetNotFound => Err(StateError::DatasetNotFound(dataset_id).into()),
            StartOutcome::DatasetBlocked(status) => {
                warn!(%dataset_id, %status, "Dataset cannot enter analysis");
                Err(StateError::DatasetBusy {
                    id: dataset_id,
                    status,
                }
                .into())
            }
        }
    }

    /// `Pending -> Running`.
    pub fn begin(&self, session_id: Uuid) -> Result<AnalysisSession> {
        self.transition(SessionTransition {
            session_id,
            to: SessionStatus::Running,
            dataset_to: None,
            error_message: None,
            results: None,
        })
    }

    /// Record progress; out-of-order values are dropped, terminal sessions rejected.
    pub fn record_progress(&self, session_id: Uuid, percent: u8) -> Result<ProgressUpdate> {
        let percent = percent.min(100);
        match self.store.record_progress(session_id, percent)? {
            ProgressOutcome::Applied(session) => {
                debug!(%session_id, progress = session.progress, "Progress recorded");
                Ok(ProgressUpdate::Applied(session.progress))
            }
            ProgressOutcome::Stale(session) => {
                debug!(%session_id, requested = percent, current = session.progress, "Dropped out-of-order progress");
                Ok(ProgressUpdate::Dropped {
                    current: session.progress,
                })
            }
            ProgressOutcome::Terminal(session) => {
                warn!(%session_id, status = %session.status, "Progress rejected for terminal session");
                Err(StateError::TerminalSession {
                    id: session_id,
                    status: session.status,
                }
                .into())
            }
            ProgressOutcome::NotFound => Err(StateError::SessionNotFound(session_id).into()),
        }
    }

    /// `Running -> Completed`, writing the report and anomalies in the same step.
    pub fn complete(
        &self,
        session_id: Uuid,
        report: AnomalyReport,
        anomalies: Vec<DetectedAnomaly>,
    ) -> Result<AnalysisSession> {
        if report.session_id != session_id {
            return Err(StateError::ReportMismatch {
                session: session_id,
                report: report.session_id,
            }
            .into());
        }
        let session = self.transition(SessionTransition {
            session_id,
            to: SessionStatus::Completed,
            dataset_to: Some(DatasetStatus::Analyzed),
            error_message: None,
            results: Some(SessionResults { report, anomalies }),
        })?;
        self.release(session_id);
        Ok(session)
    }

    /// Fail a non-terminal session, from `Pending` or `Running`.
    pub fn fail(&self, session_id: Uuid, error_message: &str) -> Result<AnalysisSession> {
        let session = self.transition(SessionTransition {
            session_id,
            to: SessionStatus::Failed,
            dataset_to: Some(DatasetStatus::Error),
            error_message: Some(error_message.to_string()),
            results: None,
        })?;
        self.release(session_id);
        Ok(session)
    }

    /// Token the running analysis polls; created on first request.
    pub fn cancellation_token(&self, session_id: Uuid) -> CancellationToken {
        self.cancellations.get_or_create(session_id)
    }

    /// Ask a session to stop.
    ///
    /// A session with a live runner is signalled and failed by that runner;
    /// one nobody is driving is failed here directly.
    pub fn cancel(&self, session_id: Uuid) -> Result<AnalysisSession> {
        let session = self.session(session_id)?;
        if session.status.is_terminal() {
            return Err(StateError::TerminalSession {
                id: session_id,
                status: session.status,
            }
            .into());
        }

        let token = self.cancellations.get(session_id);
        match token {
            Some(token) => {
                info!(%session_id, "Cancellation requested");
                token.cancel();
                Ok(session)
            }
            None => self.fail(session_id, CANCELLED_MESSAGE),
        }
    }

    /// The report of a `Completed` session.
    pub fn report(&self, session_id: Uuid) -> Result<AnomalyReport> {
        let session = self.session(session_id)?;
        if session.status != SessionStatus::Completed {
            return Err(StateError::NotCompleted {
                id: session_id,
                status: session.status,
            }
            .into());
        }
        let report = self.store.report(session_id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("completed session {} has no report", session_id))
        })?;
        Ok(report)
    }

    pub fn anomalies(&self, session_id: Uuid) -> Result<Vec<DetectedAnomaly>> {
        self.session(session_id)?;
        Ok(self.store.anomalies(session_id)?)
    }

    /// Drop the cancellation token of a session that has stopped running.
    pub(crate) fn release(&self, session_id: Uuid) {
        self.cancellations.remove(session_id);
    }

    fn transition(&self, change: SessionTransition) -> Result<AnalysisSession> {
        let session_id = change.session_id;
        let to = change.to;
        let dataset_to = change.dataset_to;

        match self.store.transition_session(change)? {
            TransitionOutcome::Applied(session) => {
                info!(
                    %session_id,
                    dataset_id = %session.dataset_id,
                    status = %session.status,
                    error = session.error_message.as_deref().unwrap_or(""),
                    "Session transitioned"
                );
                Ok(session)
            }
            TransitionOutcome::Rejected(session) if session.status.is_terminal() => {
                warn!(%session_id, status = %session.status, requested = %to, "Transition rejected for terminal session");
                Err(StateError::TerminalSession {
                    id: session_id,
                    status: session.status,
                }
                .into())
            }
            TransitionOutcome::Rejected(session) => {
                warn!(%session_id, from = %session.status, requested = %to, "Invalid session transition");
                Err(StateError::InvalidTransition {
                    id: session_id,
                    from: session.status,
                    to,
                }
                .into())
            }
            TransitionOutcome::DatasetRejected(from) => {
                let to = dataset_to.unwrap_or(from);
                warn!(%session_id, %from, %to, "Invalid dataset transition");
                Err(StateError::DatasetTransition {
                    session: session_id,
                    from,
                    to,
                }
                .into())
            }
            TransitionOutcome::NotFound => Err(StateError::SessionNotFound(session_id).into()),
        }
    }
}
