//! SQLite-backed [`Store`].
//!
//! Mutations run inside `BEGIN IMMEDIATE` transactions so the status check
//! and the write cannot interleave with another writer. The partial unique
//! index created by the schema migration backs the one-active-session rule.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{
    open_pool, Pool, ProgressOutcome, SessionTransition, StartOutcome, Store, StoreError,
    TransitionOutcome,
};
use crate::classify::DetectedAnomaly;
use crate::report::AnomalyReport;
use crate::session::{AnalysisSession, Dataset, DatasetStatus, SessionStatus};

const DATASET_COLUMNS: &str = "id, name, status, uploaded_at, analyzed_at";
const SESSION_COLUMNS: &str =
    "id, dataset_id, status, progress, started_at, completed_at, error_message";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `path`, running migrations.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_col<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn parse_opt_col<T>(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    raw.map(|r| parse_col(idx, r)).transpose()
}

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        id: parse_col(0, row.get(0)?)?,
        name: row.get(1)?,
        status: parse_col(2, row.get(2)?)?,
        uploaded_at: parse_col(3, row.get(3)?)?,
        analyzed_at: parse_opt_col(4, row.get(4)?)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisSession> {
    Ok(AnalysisSession {
        id: parse_col(0, row.get(0)?)?,
        dataset_id: parse_col(1, row.get(1)?)?,
        status: parse_col(2, row.get(2)?)?,
        progress: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
        started_at: parse_col(4, row.get(4)?)?,
        completed_at: parse_opt_col(5, row.get(5)?)?,
        error_message: row.get(6)?,
    })
}

fn query_dataset(conn: &Connection, id: Uuid) -> Result<Option<Dataset>, StoreError> {
    let dataset = conn
        .query_row(
            &format!("SELECT {} FROM datasets WHERE id = ?1", DATASET_COLUMNS),
            params![id.to_string()],
            dataset_from_row,
        )
        .optional()?;
    Ok(dataset)
}

fn query_session(conn: &Connection, id: Uuid) -> Result<Option<AnalysisSession>, StoreError> {
    let session = conn
        .query_row(
            &format!("SELECT {} FROM analysis_sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id.to_string()],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

fn active_session(conn: &Connection, dataset_id: Uuid) -> Result<Option<AnalysisSession>, StoreError> {
    let session = conn
        .query_row(
            &format!(
                "SELECT {} FROM analysis_sessions
                 WHERE dataset_id = ?1 AND status IN ('Pending', 'Running')
                 ORDER BY started_at DESC LIMIT 1",
                SESSION_COLUMNS
            ),
            params![dataset_id.to_string()],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

impl Store for SqliteStore {
    fn insert_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO datasets (id, name, status, uploaded_at, analyzed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                dataset.id.to_string(),
                dataset.name,
                dataset.status.as_str(),
                timestamp(dataset.uploaded_at),
                dataset.analyzed_at.map(timestamp),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateDataset(dataset.id));
        }
        Ok(())
    }

    fn dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        let conn = self.pool.get()?;
        query_dataset(&conn, id)
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM datasets ORDER BY uploaded_at ASC",
            DATASET_COLUMNS
        ))?;
        let rows = stmt.query_map([], dataset_from_row)?;
        let mut datasets = Vec::new();
        for r in rows {
            datasets.push(r?);
        }
        Ok(datasets)
    }

    fn session(&self, id: Uuid) -> Result<Option<AnalysisSession>, StoreError> {
        let conn = self.pool.get()?;
        query_session(&conn, id)
    }

    fn sessions_for_dataset(&self, dataset_id: Uuid) -> Result<Vec<AnalysisSession>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM analysis_sessions WHERE dataset_id = ?1 ORDER BY started_at ASC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![dataset_id.to_string()], session_from_row)?;
        let mut sessions = Vec::new();
        for r in rows {
            sessions.push(r?);
        }
        Ok(sessions)
    }

    fn create_session_if_idle(&self, session: AnalysisSession) -> Result<StartOutcome, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(dataset) = query_dataset(&tx, session.dataset_id)? else {
            return Ok(StartOutcome::DatasetNotFound);
        };
        if let Some(existing) = active_session(&tx, session.dataset_id)? {
            debug!(session_id = %existing.id, dataset_id = %existing.dataset_id, "Active session already present");
            return Ok(StartOutcome::Existing(existing));
        }
        if !dataset.status.can_transition_to(DatasetStatus::Analyzing) {
            return Ok(StartOutcome::DatasetBlocked(dataset.status));
        }

        tx.execute(
            "INSERT INTO analysis_sessions (id, dataset_id, status, progress, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id.to_string(),
                session.dataset_id.to_string(),
                session.status.as_str(),
                session.progress,
                timestamp(session.started_at),
            ],
        )?;
        tx.execute(
            "UPDATE datasets SET status = ?1 WHERE id = ?2",
            params![DatasetStatus::Analyzing.as_str(), session.dataset_id.to_string()],
        )?;
        tx.commit()?;

        Ok(StartOutcome::Created(session))
    }

    fn record_progress(&self, session_id: Uuid, percent: u8) -> Result<ProgressOutcome, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut session) = query_session(&tx, session_id)? else {
            return Ok(ProgressOutcome::NotFound);
        };
        if session.status.is_terminal() {
            return Ok(ProgressOutcome::Terminal(session));
        }
        if percent < session.progress {
            return Ok(ProgressOutcome::Stale(session));
        }

        tx.execute(
            "UPDATE analysis_sessions SET progress = ?1 WHERE id = ?2",
            params![percent, session_id.to_string()],
        )?;
        tx.commit()?;

        session.progress = percent;
        Ok(ProgressOutcome::Applied(session))
    }

    fn transition_session(&self, change: SessionTransition) -> Result<TransitionOutcome, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut session) = query_session(&tx, change.session_id)? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !session.status.can_transition_to(change.to) {
            return Ok(TransitionOutcome::Rejected(session));
        }

        let now = Utc::now();
        if let Some(dataset_to) = change.dataset_to {
            let dataset = query_dataset(&tx, session.dataset_id)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "session {} references missing dataset {}",
                    session.id, session.dataset_id
                ))
            })?;
            if !dataset.status.can_transition_to(dataset_to) {
                return Ok(TransitionOutcome::DatasetRejected(dataset.status));
            }
            let analyzed_at = (dataset_to == DatasetStatus::Analyzed).then(|| timestamp(now));
            tx.execute(
                "UPDATE datasets SET status = ?1, analyzed_at = COALESCE(?2, analyzed_at)
                 WHERE id = ?3",
                params![dataset_to.as_str(), analyzed_at, dataset.id.to_string()],
            )?;
        }

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

        tx.execute(
            "UPDATE analysis_sessions
             SET status = ?1, progress = ?2, completed_at = ?3, error_message = ?4
             WHERE id = ?5",
            params![
                session.status.as_str(),
                session.progress,
                session.completed_at.map(timestamp),
                session.error_message,
                session.id.to_string(),
            ],
        )?;

        if let Some(results) = &change.results {
            let mut insert = tx.prepare(
                "INSERT INTO detected_anomalies (session_id, sample_index, score, severity)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for a in results.anomalies.iter().filter(|a| a.severity.is_anomalous()) {
                insert.execute(params![
                    session.id.to_string(),
                    a.sample_index as i64,
                    a.score,
                    a.severity.as_str(),
                ])?;
            }
            drop(insert);

            tx.execute(
                "INSERT INTO anomaly_reports (session_id, report_json) VALUES (?1, ?2)",
                params![session.id.to_string(), serde_json::to_string(&results.report)?],
            )?;
        }

        tx.commit()?;
        Ok(TransitionOutcome::Applied(session))
    }

    fn report(&self, session_id: Uuid) -> Result<Option<AnomalyReport>, StoreError> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT report_json FROM anomaly_reports WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    fn anomalies(&self, session_id: Uuid) -> Result<Vec<DetectedAnomaly>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT sample_index, score, severity FROM detected_anomalies
             WHERE session_id = ?1 ORDER BY sample_index ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok(DetectedAnomaly {
                sample_index: row.get::<_, i64>(0)? as usize,
                score: row.get(1)?,
                severity: parse_col(2, row.get(2)?)?,
                session_id,
            })
        })?;
        let mut anomalies = Vec::new();
        for r in rows {
            anomalies.push(r?);
        }
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_dataset_round_trip() {
        let (_dir, store) = temp_store();
        let dataset = Dataset::new("netflow-2026-10");
        store.insert_dataset(&dataset).unwrap();

        let loaded = store.dataset(dataset.id).unwrap().unwrap();
        assert_eq!(loaded.id, dataset.id);
        assert_eq!(loaded.status, DatasetStatus::Uploaded);
        assert!(matches!(
            store.insert_dataset(&dataset),
            Err(StoreError::DuplicateDataset(_))
        ));
    }

    #[test]
    fn test_second_create_returns_existing() {
        let (_dir, store) = temp_store();
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();

        let first = store
            .create_session_if_idle(AnalysisSession::pending(dataset.id))
            .unwrap();
        let StartOutcome::Created(created) = first else {
            panic!("expected a new session, got {:?}", first);
        };
        let second = store
            .create_session_if_idle(AnalysisSession::pending(dataset.id))
            .unwrap();
        assert_eq!(second, StartOutcome::Existing(created));
        assert_eq!(store.sessions_for_dataset(dataset.id).unwrap().len(), 1);
        assert_eq!(
            store.dataset(dataset.id).unwrap().unwrap().status,
            DatasetStatus::Analyzing
        );
    }

    #[test]
    fn test_create_for_missing_dataset() {
        let (_dir, store) = temp_store();
        let outcome = store
            .create_session_if_idle(AnalysisSession::pending(Uuid::new_v4()))
            .unwrap();
        assert_eq!(outcome, StartOutcome::DatasetNotFound);
    }

    #[test]
    fn test_progress_rules() {
        let (_dir, store) = temp_store();
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();
        let session = AnalysisSession::pending(dataset.id);
        store.create_session_if_idle(session.clone()).unwrap();

        assert!(matches!(
            store.record_progress(session.id, 40).unwrap(),
            ProgressOutcome::Applied(s) if s.progress == 40
        ));
        assert!(matches!(
            store.record_progress(session.id, 10).unwrap(),
            ProgressOutcome::Stale(s) if s.progress == 40
        ));
        assert_eq!(
            store.record_progress(Uuid::new_v4(), 10).unwrap(),
            ProgressOutcome::NotFound
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (_dir, store) = temp_store();
        let dataset = Dataset::new("d");
        store.insert_dataset(&dataset).unwrap();
        let session = AnalysisSession::pending(dataset.id);
        store.create_session_if_idle(session.clone()).unwrap();

        let outcome = store
            .transition_session(SessionTransition {
                session_id: session.id,
                to: SessionStatus::Completed,
                dataset_to: Some(DatasetStatus::Analyzed),
                error_message: None,
                results: None,
            })
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected(s) if s.status == SessionStatus::Pending));
        assert_eq!(
            store.dataset(dataset.id).unwrap().unwrap().status,
            DatasetStatus::Analyzing
        );
    }
}
