//! Drives one analysis session from start to a terminal state.
//!
//! 1. Start (or reuse) the dataset's session
//! 2. Obtain scores, from the request or the scoring oracle
//! 3. Pick a threshold (calibrated, fallback, or supplied)
//! 4. Classify every sample
//! 5. Build the triage report and complete the session
//!
//! Any failure after the session exists is recorded on the session rather
//! than returned, so callers observe it through the session status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::machine::CANCELLED_MESSAGE;
use super::{AnalysisSession, SessionStateMachine, Started, StateError};
use crate::calibrate::{select_threshold, CalibrationConfig, CalibrationError, Calibrator, CostModel};
use crate::classify::{Classifier, SeverityTiers};
use crate::error::{ConfigError, Result, TriageError};
use crate::ingest::{ingest, ScoreBatch};
use crate::oracle::ScoringOracle;
use crate::report::{build, ReportContext};

/// Where a session gets its scores.
#[derive(Debug, Clone)]
pub enum ScoreSource {
    /// Scores already validated by [`ingest`].
    Batch(ScoreBatch),
    /// Raw samples to send to the scoring oracle once the session is running.
    Samples {
        samples: Vec<Vec<f64>>,
        labels: Option<Vec<bool>>,
    },
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub dataset_id: Uuid,
    pub source: ScoreSource,
    /// Skip calibration and classify with this threshold.
    pub threshold: Option<f64>,
    /// Overrides the configured cost model.
    pub cost: Option<CostModel>,
    /// Overrides the configured report length.
    pub top_n: Option<usize>,
}

impl AnalysisRequest {
    pub fn new(dataset_id: Uuid, source: ScoreSource) -> Self {
        Self {
            dataset_id,
            source,
            threshold: None,
            cost: None,
            top_n: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }
}

/// Tunables for every session a runner drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub calibration: CalibrationConfig,
    pub tiers: SeverityTiers,
    pub top_n: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfig::default(),
            tiers: SeverityTiers::default(),
            top_n: 20,
        }
    }
}

/// Progress milestones written as a session advances.
mod milestone {
    pub const RUNNING: u8 = 5;
    pub const SCORED: u8 = 20;
    pub const THRESHOLD: u8 = 60;
    pub const CLASSIFIED: u8 = 80;
    pub const REPORTED: u8 = 90;
}

pub struct AnalysisRunner {
    machine: Arc<SessionStateMachine>,
    oracle: Arc<dyn ScoringOracle>,
    calibrator: Calibrator,
    classifier: Classifier,
    cost: CostModel,
    fallback_percentile: f64,
    top_n: usize,
}

impl AnalysisRunner {
    pub fn new(
        machine: Arc<SessionStateMachine>,
        oracle: Arc<dyn ScoringOracle>,
        settings: &AnalysisSettings,
    ) -> std::result::Result<Self, ConfigError> {
        settings.calibration.validate()?;
        Ok(Self {
            machine,
            oracle,
            calibrator: Calibrator::new(settings.calibration.grid.clone())?,
            classifier: Classifier::new(settings.tiers)?,
            cost: settings.calibration.cost_model()?,
            fallback_percentile: settings.calibration.fallback_percentile,
            top_n: settings.top_n,
        })
    }

    pub fn machine(&self) -> &Arc<SessionStateMachine> {
        &self.machine
    }

    /// Run an analysis to completion and return the terminal session.
    ///
    /// If the dataset already has a session in flight, that session is
    /// returned unchanged and nothing new runs.
    pub async fn run(&self, request: AnalysisRequest) -> Result<AnalysisSession> {
        self.validate(&request)?;
        match self.machine.start_analysis(request.dataset_id)? {
            Started::New(session) => self.drive(session.id, request).await,
            Started::Existing(session) => Ok(session),
        }
    }

    /// Start an analysis and drive it on a background task.
    ///
    /// Returns the session as created; poll its status and progress for the outcome.
    pub async fn submit(self: &Arc<Self>, request: AnalysisRequest) -> Result<AnalysisSession> {
        self.validate(&request)?;
        let session = match self.machine.start_analysis(request.dataset_id)? {
            Started::New(session) => session,
            Started::Existing(session) => return Ok(session),
        };

        let runner = Arc::clone(self);
        let session_id = session.id;
        tokio::spawn(async move {
            if let Err(e) = runner.drive(session_id, request).await {
                error!(%session_id, error = %e, "Background analysis could not record its outcome");
            }
        });
        Ok(session)
    }

    /// Reject bad parameters before any session exists.
    fn validate(&self, request: &AnalysisRequest) -> std::result::Result<(), ConfigError> {
        if let Some(t) = request.threshold {
            if !(t.is_finite() && t > 0.0) {
                return Err(ConfigError::NonPositiveThreshold(t));
            }
        }
        if let Some(cost) = &request.cost {
            cost.validate()?;
        }
        Ok(())
    }

    async fn drive(&self, session_id: Uuid, request: AnalysisRequest) -> Result<AnalysisSession> {
        let token = self.machine.cancellation_token(session_id);
        let failure = match self.execute(session_id, request, &token).await {
            Ok(session) => return Ok(session),
            Err(e) => e,
        };

        let message = match &failure {
            TriageError::Calibration(CalibrationError::Cancelled { .. }) => CANCELLED_MESSAGE.to_string(),
            other => other.to_string(),
        };
        error!(%session_id, error = %message, "Analysis failed");

        match self.machine.fail(session_id, &message) {
            Ok(session) => Ok(session),
            // Someone else already finished the session; report what they left.
            Err(TriageError::State(StateError::TerminalSession { .. })) => {
                self.machine.release(session_id);
                self.machine.session(session_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        session_id: Uuid,
        request: AnalysisRequest,
        token: &CancellationToken,
    ) -> Result<AnalysisSession> {
        self.machine.begin(session_id)?;
        self.machine.record_progress(session_id, milestone::RUNNING)?;

        let batch = match request.source {
            ScoreSource::Batch(batch) => batch,
            ScoreSource::Samples { samples, labels } => {
                let scores = self.oracle.score(&samples).await?;
                ingest(scores, labels)?
            }
        };
        checkpoint(token)?;
        self.machine.record_progress(session_id, milestone::SCORED)?;

        let batch = Arc::new(batch);
        let cost = request.cost.unwrap_or(self.cost);

        let decision = {
            let batch = Arc::clone(&batch);
            let calibrator = self.calibrator.clone();
            let token = token.clone();
            let fallback = self.fallback_percentile;
            let supplied = request.threshold;
            tokio::task::spawn_blocking(move || {
                select_threshold(&batch, &calibrator, &cost, fallback, supplied, &token)
            })
            .await??
        };
        checkpoint(token)?;
        self.machine.record_progress(session_id, milestone::THRESHOLD)?;

        let classified = {
            let batch = Arc::clone(&batch);
            let classifier = self.classifier;
            let threshold = decision.threshold;
            tokio::task::spawn_blocking(move || classifier.classify(&batch, threshold)).await??
        };
        checkpoint(token)?;
        self.machine.record_progress(session_id, milestone::CLASSIFIED)?;

        let anomalies: Vec<_> = classified
            .into_iter()
            .map(|c| c.into_anomaly(session_id))
            .collect();
        let context = ReportContext {
            session_id,
            decision,
            cost,
            summary: batch.summary(),
        };
        let report = build(&anomalies, &context, request.top_n.unwrap_or(self.top_n));
        self.machine.record_progress(session_id, milestone::REPORTED)?;
        checkpoint(token)?;

        info!(
            %session_id,
            samples = report.total_samples,
            anomalies = report.anomaly_count,
            threshold = report.threshold_used,
            validated = report.threshold_validated,
            "Analysis complete"
        );
        self.machine.complete(session_id, report, anomalies)
    }
}

fn checkpoint(token: &CancellationToken) -> std::result::Result<(), CalibrationError> {
    if token.is_cancelled() {
        Err(CalibrationError::Cancelled { tested: 0 })
    } else {
        Ok(())
    }
}
