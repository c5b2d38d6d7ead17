//! Session lifecycle against both stores, including concurrent starts.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anomalytriage::error::{StateError, TriageError};
use anomalytriage::ingest::ingest;
use anomalytriage::oracle::StaticScores;
use anomalytriage::session::machine::CANCELLED_MESSAGE;
use anomalytriage::session::runner::AnalysisSettings;
use anomalytriage::session::{
    AnalysisRequest, AnalysisRunner, AnalysisSession, DatasetStatus, ScoreSource,
    SessionStateMachine, SessionStatus,
};
use anomalytriage::storage::{MemoryStore, SqliteStore, Store};
use tempfile::TempDir;
use uuid::Uuid;

fn sqlite_store(dir: &TempDir) -> Arc<dyn Store> {
    let path = dir.path().join("triage.db");
    Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap())
}

fn concurrent_starts(machine: Arc<SessionStateMachine>, dataset_id: Uuid, n: usize) -> Vec<Uuid> {
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let machine = Arc::clone(&machine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                machine.start_analysis(dataset_id).unwrap().into_session().id
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_single_active(machine: &SessionStateMachine, dataset_id: Uuid, ids: &[Uuid]) {
    let active: Vec<AnalysisSession> = machine
        .sessions_for_dataset(dataset_id)
        .unwrap()
        .into_iter()
        .filter(|s| !s.status.is_terminal())
        .collect();
    assert_eq!(active.len(), 1);
    assert!(ids.iter().all(|id| *id == active[0].id));
}

#[test]
fn test_concurrent_start_sqlite() {
    let dir = TempDir::new().unwrap();
    let machine = Arc::new(SessionStateMachine::new(sqlite_store(&dir)));
    let dataset = machine.register_dataset("shared").unwrap();

    let ids = concurrent_starts(Arc::clone(&machine), dataset.id, 8);
    assert_single_active(&machine, dataset.id, &ids);
    assert_eq!(machine.dataset(dataset.id).unwrap().status, DatasetStatus::Analyzing);
}

#[test]
fn test_concurrent_start_memory() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let dataset = machine.register_dataset("shared").unwrap();

    let ids = concurrent_starts(Arc::clone(&machine), dataset.id, 8);
    assert_single_active(&machine, dataset.id, &ids);
}

#[test]
fn test_progress_after_completion_is_rejected_sqlite() {
    let dir = TempDir::new().unwrap();
    let machine = SessionStateMachine::new(sqlite_store(&dir));
    let dataset = machine.register_dataset("d").unwrap();
    let session = machine.start_analysis(dataset.id).unwrap().into_session();
    machine.begin(session.id).unwrap();
    machine.record_progress(session.id, 40).unwrap();
    machine.fail(session.id, "scoring unavailable: offline").unwrap();

    let err = machine.record_progress(session.id, 90).unwrap_err();
    assert!(matches!(
        err,
        TriageError::State(StateError::TerminalSession { status: SessionStatus::Failed, .. })
    ));
    let after = machine.session(session.id).unwrap();
    assert_eq!(after.status, SessionStatus::Failed);
    assert_eq!(after.progress, 40);
}

#[tokio::test]
async fn test_completed_session_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (dataset_id, session_id) = {
        let machine = Arc::new(SessionStateMachine::new(sqlite_store(&dir)));
        let runner = AnalysisRunner::new(
            Arc::clone(&machine),
            Arc::new(StaticScores::default()),
            &AnalysisSettings::default(),
        )
        .unwrap();
        let dataset = machine.register_dataset("persisted").unwrap();
        let batch = ingest(
            vec![0.1, 0.2, 0.3, 5.0, 6.0],
            Some(vec![false, false, false, true, true]),
        )
        .unwrap();
        let session = runner
            .run(AnalysisRequest::new(dataset.id, ScoreSource::Batch(batch)))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        (dataset.id, session.id)
    };

    let machine = SessionStateMachine::new(sqlite_store(&dir));
    let session = machine.session(session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.progress, 100);
    assert_eq!(machine.dataset(dataset_id).unwrap().status, DatasetStatus::Analyzed);

    let report = machine.report(session_id).unwrap();
    assert_eq!(report.anomaly_count, 2);
    assert!(report.threshold_validated);

    // Completion always comes with its report.
    let again = machine.start_analysis(dataset_id).unwrap();
    assert!(again.is_new());
}

#[tokio::test]
async fn test_oracle_scores_drive_session() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let runner = AnalysisRunner::new(
        Arc::clone(&machine),
        Arc::new(StaticScores::new(vec![1.0, 1.1, 0.9, 8.0])),
        &AnalysisSettings::default(),
    )
    .unwrap();
    let dataset = machine.register_dataset("oracle").unwrap();

    let request = AnalysisRequest::new(
        dataset.id,
        ScoreSource::Samples {
            samples: vec![vec![0.0]; 4],
            labels: Some(vec![false, false, false, true]),
        },
    );
    let session = runner.run(request).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let anomalies = machine.anomalies(session.id).unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].sample_index, 3);
}

#[tokio::test]
async fn test_oracle_output_failing_validation_fails_session() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let runner = AnalysisRunner::new(
        Arc::clone(&machine),
        Arc::new(StaticScores::new(vec![1.0, 2.0])),
        &AnalysisSettings::default(),
    )
    .unwrap();
    let dataset = machine.register_dataset("oracle").unwrap();

    let request = AnalysisRequest::new(
        dataset.id,
        ScoreSource::Samples {
            samples: vec![vec![0.0]; 2],
            labels: Some(vec![true]),
        },
    );
    let session = runner.run(request).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.error_message.unwrap().starts_with("length mismatch"));
    assert_eq!(machine.dataset(dataset.id).unwrap().status, DatasetStatus::Error);
}

#[tokio::test]
async fn test_submit_runs_in_background() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let runner = Arc::new(
        AnalysisRunner::new(
            Arc::clone(&machine),
            Arc::new(StaticScores::default()),
            &AnalysisSettings::default(),
        )
        .unwrap(),
    );
    let dataset = machine.register_dataset("background").unwrap();
    let batch = ingest(vec![1.0, 2.0, 30.0], Some(vec![false, false, true])).unwrap();

    let submitted = runner
        .submit(AnalysisRequest::new(dataset.id, ScoreSource::Batch(batch)))
        .await
        .unwrap();
    assert_eq!(submitted.status, SessionStatus::Pending);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let s = machine.session(submitted.id).unwrap();
            if s.status.is_terminal() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(finished.status, SessionStatus::Completed);
    assert_eq!(finished.progress, 100);
}

#[tokio::test]
async fn test_concurrent_submits_share_one_session() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let runner = Arc::new(
        AnalysisRunner::new(
            Arc::clone(&machine),
            Arc::new(StaticScores::default()),
            &AnalysisSettings::default(),
        )
        .unwrap(),
    );
    let dataset = machine.register_dataset("burst").unwrap();
    let batch = ingest(vec![1.0, 2.0, 30.0], None).unwrap();

    let submits = (0..5).map(|_| {
        runner.submit(AnalysisRequest::new(dataset.id, ScoreSource::Batch(batch.clone())))
    });
    let sessions = futures::future::join_all(submits).await;

    let ids: Vec<Uuid> = sessions.into_iter().map(|s| s.unwrap().id).collect();
    assert_single_active(&machine, dataset.id, &ids);
}

#[tokio::test]
async fn test_cancel_before_runner_starts() {
    let machine = Arc::new(SessionStateMachine::new(Arc::new(MemoryStore::new())));
    let runner = Arc::new(
        AnalysisRunner::new(
            Arc::clone(&machine),
            Arc::new(StaticScores::default()),
            &AnalysisSettings::default(),
        )
        .unwrap(),
    );
    let dataset = machine.register_dataset("cancelled").unwrap();
    let batch = ingest(vec![1.0, 2.0, 30.0], Some(vec![false, false, true])).unwrap();

    // The current-thread runtime has not polled the spawned task yet.
    let submitted = runner
        .submit(AnalysisRequest::new(dataset.id, ScoreSource::Batch(batch)))
        .await
        .unwrap();
    let cancelled = machine.cancel(submitted.id).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let after = machine.session(submitted.id).unwrap();
    assert_eq!(after.status, SessionStatus::Failed);
    assert_eq!(after.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(machine.anomalies(submitted.id).unwrap().is_empty());
    assert!(matches!(
        machine.report(submitted.id),
        Err(TriageError::State(StateError::NotCompleted { .. }))
    ));
}
