//! In-process [`Store`] with one lock per dataset.
//!
//! Each dataset's records live behind their own mutex. The outer maps are
//! only locked long enough to find or insert an entry, and never while a
//! dataset mutex is held.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    ProgressOutcome, SessionTransition, StartOutcome, Store, StoreError, TransitionOutcome,
};
use crate::classify::DetectedAnomaly;
use crate::report::AnomalyReport;
use crate::session::{AnalysisSession, Dataset, DatasetStatus, SessionStatus};

struct DatasetRecords {
    dataset: Dataset,
    /// Oldest first.
    sessions: Vec<AnalysisSession>,
    anomalies: HashMap<Uuid, Vec<DetectedAnomaly>>,
    reports: HashMap<Uuid, AnomalyReport>,
}

impl DatasetRecords {
    fn active(&self) -> Option<&AnalysisSession> {
        self.sessions.iter().find(|s| !s.status.is_terminal())
    }

    fn session_mut(&mut self, id: Uuid) -> Option<&mut AnalysisSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    datasets: RwLock<HashMap<Uuid, Arc<Mutex<DatasetRecords>>>>,
    /// session id -> owning dataset id
    session_index: RwLock<HashMap<Uuid, Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self, dataset_id: Uuid) -> Option<Arc<Mutex<DatasetRecords>>> {
        self.datasets.read().get(&dataset_id).cloned()
    }

    fn records_for_session(&self, session_id: Uuid) -> Option<Arc<Mutex<DatasetRecords>>> {
        let dataset_id = *self.session_index.read().get(&session_id)?;
        self.records(dataset_id)
    }

    fn push_if_idle(records: &mut DatasetRecords, session: AnalysisSession) -> StartOutcome {
        if let Some(existing) = records.active() {
            return StartOutcome::Existing(existing.clone());
        }
        if !records.dataset.status.can_transition_to(DatasetStatus::Analyzing) {
            return StartOutcome::DatasetBlocked(records.dataset.status);
        }
        records.dataset.status = DatasetStatus::Analyzing;
        records.sessions.push(session.clone());
        StartOutcome::Created(session)
    }
}

impl Store for MemoryStore {
    fn insert_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut datasets = self.datasets.write();
        if datasets.contains_key(&dataset.id) {
            return Err(StoreError::DuplicateDataset(dataset.id));
        }
        datasets.insert(
            dataset.id,
            Arc::new(Mutex::new(DatasetRecords {
                dataset: dataset.clone(),
                sessions: Vec::new(),
                anomalies: HashMap::new(),
                reports: HashMap::new(),
            })),
        );
        Ok(())
    }

    fn dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        Ok(self.records(id).map(|r| r.lock().dataset.clone()))
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        let all: Vec<_> = self.datasets.read().values().cloned().collect();
        let mut datasets: Vec<Dataset> = all.iter().map(|r| r.lock().dataset.clone()).collect();
        datasets.sort_by_key(|d| d.uploaded_at);
        Ok(datasets)
    }

    fn session(&self, id: Uuid) -> Result<Option<AnalysisSession>, StoreError> {
        let Some(records) = self.records_for_session(id) else {
            return Ok(None);
        };
        let records = records.lock();
        Ok(records.sessions.iter().find(|s| s.id == id).cloned())
    }

    fn sessions_for_dataset(&self, dataset_id: Uuid) -> Result<Vec<AnalysisSession>, StoreError> {
        Ok(self
            .records(dataset_id)
            .map(|r| r.lock().sessions.clone())
            .unwrap_or_default())
    }

    fn create_session_if_idle(&self, session: AnalysisSession) -> Result<StartOutcome, StoreError> {
        let Some(records) = self.records(session.dataset_id) else {
            return Ok(StartOutcome::DatasetNotFound);
        };

        // Indexed up front; lookups find nothing until the push below.
        let candidate_id = session.id;
        self.session_index.write().insert(candidate_id, session.dataset_id);
        let outcome = Self::push_if_idle(&mut records.lock(), session);
        if !matches!(outcome, StartOutcome::Created(_)) {
            self.session_index.write().remove(&candidate_id);
        }
        Ok(outcome)
    }

    fn record_progress(&self, session_id: Uuid, percent: u8) -> Result<ProgressOutcome, StoreError> {
        let Some(records) = self.records_for_session(session_id) else {
            return Ok(ProgressOutcome::NotFound);
        };
        let mut records = records.lock();
        let Some(session) = records.session_mut(session_id) else {
            return Ok(ProgressOutcome::NotFound);
        };

        if session.status.is_terminal() {
            return Ok(ProgressOutcome::Terminal(session.clone()));
        }
        if percent < session.progress {
            return Ok(ProgressOutcome::Stale(session.clone()));
        }
        session.progress = percent;
        Ok(ProgressOutcome::Applied(session.clone()))
    }

    fn transition_session(&self, change: SessionTransition) -> Result<TransitionOutcome, StoreError> {
        let Some(records) = self.records_for_session(change.session_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let mut guard = records.lock();
        let records = &mut *guard;

        let Some(current) = records.sessions.iter().find(|s| s.id == change.session_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !current.status.can_transition_to(change.to) {
            return Ok(TransitionOutcome::Rejected(current.clone()));
        }
        if let Some(dataset_to) = change.dataset_to {
            if !records.dataset.status.can_transition_to(dataset_to) {
                return Ok(TransitionOutcome::DatasetRejected(records.dataset.status));
            }
        }

        // All checks passed; nothing below can fail.
        let now = Utc::now();
        if let Some(dataset_to) = change.dataset_to {
            records.dataset.status = dataset_to;
            if dataset_to == DatasetStatus::Analyzed {
                records.dataset.analyzed_at = Some(now);
            }
        }
        if let Some(results) = change.results {
            let anomalies = results
                .anomalies
                .into_iter()
                .filter(|a| a.severity.is_anomalous())
                .collect();
            records.anomalies.insert(change.session_id, anomalies);
            records.reports.insert(change.session_id, results.report);
        }

        let Some(session) = records.session_mut(change.session_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        session.status = change.to;
        if change.to == SessionStatus::Completed {
            session.progress = 100;
        }
        if change.to.is_terminal() {
            session.completed_at = Some(now);
        }
        if change.error_message.is_some() {
            session.error_message = change.error_message;
        }
        Ok(TransitionOutcome::Applied(session.clone()))
    }

    fn report(&self, session_id: Uuid) -> Result<Option<AnomalyReport>, StoreError> {
        Ok(self
            .records_for_session(session_id)
            .and_then(|r| r.lock().reports.get(&session_id).cloned()))
    }

    fn anomalies(&self, session_id: Uuid) -> Result<Vec<DetectedAnomaly>, StoreError> {
        let mut anomalies = self
            .records_for_session(session_id)
            .and_then(|r| r.lock().anomalies.get(&session_id).cloned())
            .unwrap_or_default();
        anomalies.sort_by_key(|a| a.sample_index);
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_concurrent_creates_yield_one_session() {
        let store = Arc::new(MemoryStore::new());
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                let dataset_id = dataset.id;
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .create_session_if_idle(AnalysisSession::pending(dataset_id))
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let created = outcomes
            .iter()
            .filter(|o| matches!(o, StartOutcome::Created(_)))
            .count();
        assert_eq!(created, 1);

        let sessions = store.sessions_for_dataset(dataset.id).unwrap();
        assert_eq!(sessions.len(), 1);
        for o in outcomes {
            match o {
                StartOutcome::Created(s) | StartOutcome::Existing(s) => assert_eq!(s.id, sessions[0].id),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_terminal_session_ignores_progress() {
        let store = MemoryStore::new();
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();
        let session = AnalysisSession::pending(dataset.id);
        store.create_session_if_idle(session.clone()).unwrap();
        store
            .transition_session(SessionTransition {
                session_id: session.id,
                to: SessionStatus::Failed,
                dataset_to: Some(DatasetStatus::Error),
                error_message: Some("boom".into()),
                results: None,
            })
            .unwrap();

        assert!(matches!(
            store.record_progress(session.id, 50).unwrap(),
            ProgressOutcome::Terminal(s) if s.progress == 0 && s.status == SessionStatus::Failed
        ));
    }

    #[test]
    fn test_rejected_start_leaves_no_index_entry() {
        let store = MemoryStore::new();
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();
        let first = AnalysisSession::pending(dataset.id);
        store.create_session_if_idle(first.clone()).unwrap();

        let second = AnalysisSession::pending(dataset.id);
        assert!(matches!(
            store.create_session_if_idle(second.clone()).unwrap(),
            StartOutcome::Existing(s) if s.id == first.id
        ));
        assert_eq!(store.session(second.id).unwrap(), None);
        assert!(!store.session_index.read().contains_key(&second.id));
        assert_eq!(store.session(first.id).unwrap().map(|s| s.id), Some(first.id));
    }

    #[test]
    fn test_busy_dataset_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let busy = Dataset::new("busy");
        let idle = Dataset::new("idle");
        store.insert_dataset(&busy).unwrap();
        store.insert_dataset(&idle).unwrap();

        let held = store.records(busy.id).unwrap();
        let _guard = held.lock();

        let other = Arc::clone(&store);
        let handle = thread::spawn(move || {
            let session = AnalysisSession::pending(idle.id);
            let outcome = other.create_session_if_idle(session.clone()).unwrap();
            (outcome, other.session(session.id).unwrap())
        });
        let (outcome, found) = handle.join().unwrap();
        assert!(matches!(outcome, StartOutcome::Created(_)));
        assert!(found.is_some());
    }
}
