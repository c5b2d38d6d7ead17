//! Database schema and migrations.

use rusqlite::Connection;
use tracing::warn;

use super::StoreError;

/// Timestamp format shared by every column written from SQL, parseable as RFC 3339.
pub(crate) const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Run all pending migrations.
pub fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS datasets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            analyzed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS analysis_sessions (
            id TEXT PRIMARY KEY,
            dataset_id TEXT NOT NULL REFERENCES datasets(id),
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS detected_anomalies (
            session_id TEXT NOT NULL REFERENCES analysis_sessions(id),
            sample_index INTEGER NOT NULL,
            score REAL NOT NULL,
            severity TEXT NOT NULL,
            PRIMARY KEY (session_id, sample_index)
        );

        CREATE TABLE IF NOT EXISTS anomaly_reports (
            session_id TEXT PRIMARY KEY REFERENCES analysis_sessions(id),
            report_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_dataset ON analysis_sessions(dataset_id, started_at);",
    )?;

    // Legacy rows carried free-form status strings.
    let normalized = normalize_statuses(&tx)?;
    if normalized > 0 {
        warn!(rows = normalized, "Normalized legacy status values");
    }

    // Keep only the newest non-terminal session per dataset.
    let superseded = tx.execute(
        &format!(
            "UPDATE analysis_sessions
             SET status = 'Failed',
                 error_message = 'superseded duplicate session',
                 completed_at = {now}
             WHERE status IN ('Pending', 'Running')
             AND EXISTS (
                 SELECT 1 FROM analysis_sessions newer
                 WHERE newer.dataset_id = analysis_sessions.dataset_id
                 AND newer.status IN ('Pending', 'Running')
                 AND (newer.started_at > analysis_sessions.started_at
                      OR (newer.started_at = analysis_sessions.started_at
                          AND newer.id > analysis_sessions.id))
             )",
            now = SQL_NOW
        ),
        [],
    )?;
    if superseded > 0 {
        warn!(sessions = superseded, "Failed duplicate non-terminal sessions");
    }

    let stuck = tx.execute(
        "UPDATE datasets SET status = 'Error'
         WHERE status = 'Analyzing'
         AND NOT EXISTS (
             SELECT 1 FROM analysis_sessions s
             WHERE s.dataset_id = datasets.id AND s.status IN ('Pending', 'Running')
         )",
        [],
    )?;
    if stuck > 0 {
        warn!(datasets = stuck, "Moved datasets with no active session to Error");
    }

    // A live session needs its dataset in Analyzing to ever finish.
    let orphaned = tx.execute(
        "UPDATE datasets SET status = 'Analyzing'
         WHERE status != 'Analyzing'
         AND EXISTS (
             SELECT 1 FROM analysis_sessions s
             WHERE s.dataset_id = datasets.id AND s.status IN ('Pending', 'Running')
         )",
        [],
    )?;
    if orphaned > 0 {
        warn!(datasets = orphaned, "Moved datasets with an active session to Analyzing");
    }

    // At most one Pending/Running session per dataset, enforced by the store.
    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_session
            ON analysis_sessions(dataset_id)
            WHERE status IN ('Pending', 'Running');

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    Ok(())
}

fn normalize_statuses(conn: &Connection) -> Result<usize, StoreError> {
    const SESSION_ALIASES: &[(&str, &str)] = &[
        ("Pending", "'pending', 'queued', 'created'"),
        ("Running", "'running', 'processing', 'in_progress', 'analyzing'"),
        ("Completed", "'completed', 'complete', 'done', 'success'"),
        ("Failed", "'failed', 'error', 'cancelled', 'canceled'"),
    ];
    const DATASET_ALIASES: &[(&str, &str)] = &[
        ("Uploaded", "'uploaded', 'new', 'pending'"),
        ("Analyzing", "'analyzing', 'processing', 'running'"),
        ("Analyzed", "'analyzed', 'completed', 'done'"),
        ("Error", "'error', 'failed'"),
    ];

    let mut changed = 0;
    for (canonical, aliases) in SESSION_ALIASES {
        changed += conn.execute(
            &format!(
                "UPDATE analysis_sessions SET status = ?1
                 WHERE status != ?1 AND lower(status) IN ({})",
                aliases
            ),
            [canonical],
        )?;
    }
    for (canonical, aliases) in DATASET_ALIASES {
        changed += conn.execute(
            &format!(
                "UPDATE datasets SET status = ?1
                 WHERE status != ?1 AND lower(status) IN ({})",
                aliases
            ),
            [canonical],
        )?;
    }

    // Anything still unrecognised is failed rather than guessed at.
    changed += conn.execute(
        &format!(
            "UPDATE analysis_sessions
             SET status = 'Failed',
                 error_message = 'unrecognized legacy status: ' || status,
                 completed_at = COALESCE(completed_at, {now})
             WHERE status NOT IN ('Pending', 'Running', 'Completed', 'Failed')",
            now = SQL_NOW
        ),
        [],
    )?;
    changed += conn.execute(
        "UPDATE datasets SET status = 'Error'
         WHERE status NOT IN ('Uploaded', 'Analyzing', 'Analyzed', 'Error')",
        [],
    )?;

    Ok(changed)
}
