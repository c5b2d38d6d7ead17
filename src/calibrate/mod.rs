//! Cost-based threshold calibration.
//!
//! Scans an ascending set of candidate thresholds, scores each one with a
//! confusion matrix against ground truth, and keeps the cheapest. Only a
//! strictly lower cost replaces the incumbent, so the lowest threshold wins
//! a tie.

pub mod candidates;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::ingest::ScoreBatch;

pub use candidates::{percentile, CandidateGrid};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("no labels: calibration requires ground truth")]
    NoLabels,

    #[error("calibration cancelled after {tested} candidates")]
    Cancelled { tested: usize },

    #[error("candidate grid produced no thresholds")]
    EmptyCandidates,
}

/// Relative business cost of each error kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub fp_cost: f64,
    pub fn_cost: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fp_cost: 3.0,
            fn_cost: 10.0,
        }
    }
}

impl CostModel {
    pub fn new(fp_cost: f64, fn_cost: f64) -> Result<Self, ConfigError> {
        let model = Self { fp_cost, fn_cost };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = |c: f64| c.is_finite() && c > 0.0;
        if ok(self.fp_cost) && ok(self.fn_cost) {
            Ok(())
        } else {
            Err(ConfigError::InvalidCost {
                fp_cost: self.fp_cost,
                fn_cost: self.fn_cost,
            })
        }
    }

    pub fn cost(&self, confusion: &Confusion) -> f64 {
        confusion.false_positives as f64 * self.fp_cost
            + confusion.false_negatives as f64 * self.fn_cost
    }
}

/// Confusion matrix at one threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confusion {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl Confusion {
    /// Positive iff `score > threshold`; a score equal to the threshold is never flagged.
    pub fn at(scores: &[f64], labels: &[bool], threshold: f64) -> Self {
        let mut c = Confusion::default();
        for (&score, &actual) in scores.iter().zip(labels) {
            match (score > threshold, actual) {
                (true, true) => c.true_positives += 1,
                (true, false) => c.false_positives += 1,
                (false, false) => c.true_negatives += 1,
                (false, true) => c.false_negatives += 1,
            }
        }
        c
    }

    /// 0 when nothing was flagged.
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// 0 when there are no actual positives.
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Outcome of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub threshold: f64,
    pub confusion: Confusion,
    pub cost: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub candidates_tested: usize,
}

/// Threshold search over a fixed [`CandidateGrid`].
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    grid: CandidateGrid,
}

impl Calibrator {
    pub fn new(grid: CandidateGrid) -> Result<Self, ConfigError> {
        grid.validate()?;
        Ok(Self { grid })
    }

    pub fn grid(&self) -> &CandidateGrid {
        &self.grid
    }

    pub fn calibrate(
        &self,
        batch: &ScoreBatch,
        cost: &CostModel,
    ) -> Result<CalibrationResult, CalibrationError> {
        self.search(batch, cost, || false)
    }

    /// Same as [`Calibrator::calibrate`], polling `cancel` before each candidate.
    pub fn calibrate_cancellable(
        &self,
        batch: &ScoreBatch,
        cost: &CostModel,
        cancel: &CancellationToken,
    ) -> Result<CalibrationResult, CalibrationError> {
        self.search(batch, cost, || cancel.is_cancelled())
    }

    fn search(
        &self,
        batch: &ScoreBatch,
        cost: &CostModel,
        cancelled: impl Fn() -> bool,
    ) -> Result<CalibrationResult, CalibrationError> {
        let labels = batch.labels().ok_or(CalibrationError::NoLabels)?;
        let scores = batch.scores();
        let candidates = self.grid.candidates(&batch.sorted_scores());

        let mut best: Option<(f64, Confusion, f64)> = None;
        for (tested, &t) in candidates.iter().enumerate() {
            if cancelled() {
                return Err(CalibrationError::Cancelled { tested });
            }
            let confusion = Confusion::at(scores, labels, t);
            let c = cost.cost(&confusion);
            match best {
                Some((_, _, min)) if c >= min => {}
                _ => best = Some((t, confusion, c)),
            }
        }

        let (threshold, confusion, min_cost) = best.ok_or(CalibrationError::EmptyCandidates)?;
        debug!(
            candidates = candidates.len(),
            threshold,
            cost = min_cost,
            "Threshold search finished"
        );

        Ok(CalibrationResult {
            threshold,
            confusion,
            cost: min_cost,
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            candidates_tested: candidates.len(),
        })
    }

    /// Percentile threshold for batches without ground truth.
    ///
    /// A percentile at or below zero is raised to the smallest low-sweep
    /// value, so the threshold is always usable by the classifier.
    pub fn fallback_threshold(&self, batch: &ScoreBatch, percentile_rank: f64) -> f64 {
        match candidates::percentile(&batch.sorted_scores(), percentile_rank) {
            Some(t) if t > 0.0 => t,
            _ => self.grid.low_sweep_start,
        }
    }
}

/// Calibrate with the default candidate grid.
pub fn calibrate(batch: &ScoreBatch, cost: &CostModel) -> Result<CalibrationResult, CalibrationError> {
    Calibrator::default().calibrate(batch, cost)
}

/// Where a session's threshold came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Cost-minimising search against ground truth.
    CostMinimized,
    /// Fixed percentile of the score distribution; no ground truth.
    Percentile { percentile: f64 },
    /// Supplied by the caller.
    Supplied,
}

/// The threshold a session will classify with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDecision {
    pub threshold: f64,
    pub policy: ThresholdPolicy,
    pub calibration: Option<CalibrationResult>,
}

impl ThresholdDecision {
    /// True only when the threshold was checked against ground truth.
    pub fn validated(&self) -> bool {
        self.calibration.is_some()
    }
}

/// How to pick a threshold when a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub fp_cost: f64,
    pub fn_cost: f64,
    pub fallback_percentile: f64,
    #[serde(flatten)]
    pub grid: CandidateGrid,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let cost = CostModel::default();
        Self {
            fp_cost: cost.fp_cost,
            fn_cost: cost.fn_cost,
            fallback_percentile: 99.0,
            grid: CandidateGrid::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn cost_model(&self) -> Result<CostModel, ConfigError> {
        CostModel::new(self.fp_cost, self.fn_cost)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cost_model()?;
        self.grid.validate()?;
        if !(0.0..100.0).contains(&self.fallback_percentile) {
            return Err(ConfigError::InvalidPercentile(self.fallback_percentile));
        }
        Ok(())
    }
}

/// Resolve the threshold for a batch.
///
/// A supplied threshold wins. Otherwise labelled batches are calibrated and
/// unlabelled ones fall back to `fallback_percentile`. Only cancellation is
/// an error here; a missing-labels calibration error selects the fallback.
pub fn select_threshold(
    batch: &ScoreBatch,
    calibrator: &Calibrator,
    cost: &CostModel,
    fallback_percentile: f64,
    supplied: Option<f64>,
    cancel: &CancellationToken,
) -> Result<ThresholdDecision, CalibrationError> {
    if let Some(threshold) = supplied {
        return Ok(ThresholdDecision {
            threshold,
            policy: ThresholdPolicy::Supplied,
            calibration: None,
        });
    }

    match calibrator.calibrate_cancellable(batch, cost, cancel) {
        Ok(result) => {
            info!(
                threshold = result.threshold,
                cost = result.cost,
                f1 = result.f1,
                "Calibrated threshold"
            );
            Ok(ThresholdDecision {
                threshold: result.threshold,
                policy: ThresholdPolicy::CostMinimized,
                calibration: Some(result),
            })
        }
        Err(CalibrationError::NoLabels) => {
            let threshold = calibrator.fallback_threshold(batch, fallback_percentile);
            info!(
                threshold,
                percentile = fallback_percentile,
                "No ground truth; using unvalidated percentile threshold"
            );
            Ok(ThresholdDecision {
                threshold,
                policy: ThresholdPolicy::Percentile {
                    percentile: fallback_percentile,
                },
                calibration: None,
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ingest;

    fn labelled(scores: &[f64], labels: &[u8]) -> ScoreBatch {
        ingest(scores.to_vec(), Some(labels.iter().map(|&l| l == 1).collect())).unwrap()
    }

    #[test]
    fn test_separable_scores_reach_zero_cost() {
        let batch = labelled(&[1.0, 2.0, 3.0, 10.0, 11.0, 12.0], &[0, 0, 0, 1, 1, 1]);
        let result = calibrate(&batch, &CostModel::default()).unwrap();
        assert_eq!(result.cost, 0.0);
        assert!(result.threshold > 3.0 && result.threshold <= 10.0);
        assert_eq!(result.precision, 1.0);
        assert_eq!(result.recall, 1.0);
        assert_eq!(result.f1, 1.0);
        assert_eq!(result.confusion.true_positives, 3);
        assert_eq!(result.confusion.true_negatives, 3);
    }

    #[test]
    fn test_lowest_threshold_wins_tie() {
        // Every candidate at or above 6.5 and below 10 costs zero; the
        // 50th percentile (6.5) is the lowest of them.
        let batch = labelled(&[1.0, 2.0, 3.0, 10.0, 11.0, 12.0], &[0, 0, 0, 1, 1, 1]);
        let result = calibrate(&batch, &CostModel::default()).unwrap();
        assert_eq!(result.threshold, 6.5);
    }

    #[test]
    fn test_threshold_equal_to_score_is_not_flagged() {
        let c = Confusion::at(&[5.0, 6.0], &[true, true], 5.0);
        assert_eq!(c.true_positives, 1);
        assert_eq!(c.false_negatives, 1);
    }

    #[test]
    fn test_zero_division_conventions() {
        let c = Confusion {
            true_negatives: 4,
            ..Confusion::default()
        };
        assert_eq!(c.precision(), 0.0);
        assert_eq!(c.recall(), 0.0);
        assert_eq!(c.f1(), 0.0);
    }

    #[test]
    fn test_no_labels_is_error() {
        let batch = ingest(vec![1.0, 2.0], None).unwrap();
        assert_eq!(
            calibrate(&batch, &CostModel::default()),
            Err(CalibrationError::NoLabels)
        );
    }

    #[test]
    fn test_cancelled_before_first_candidate() {
        let batch = labelled(&[1.0, 2.0, 3.0], &[0, 0, 1]);
        let token = CancellationToken::new();
        token.cancel();
        let err = Calibrator::default()
            .calibrate_cancellable(&batch, &CostModel::default(), &token)
            .unwrap_err();
        assert_eq!(err, CalibrationError::Cancelled { tested: 0 });
    }

    #[test]
    fn test_cost_model_validation() {
        assert!(CostModel::new(3.0, 10.0).is_ok());
        assert!(CostModel::new(0.0, 10.0).is_err());
        assert!(CostModel::new(3.0, f64::NAN).is_err());
    }

    #[test]
    fn test_select_threshold_fallback_without_labels() {
        let batch = ingest((1..=100).map(|v| v as f64).collect(), None).unwrap();
        let decision = select_threshold(
            &batch,
            &Calibrator::default(),
            &CostModel::default(),
            99.0,
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(!decision.validated());
        assert_eq!(decision.policy, ThresholdPolicy::Percentile { percentile: 99.0 });
        assert!((decision.threshold - 99.01).abs() < 1e-9);
    }

    #[test]
    fn test_calibrated_threshold_is_positive_for_zero_heavy_scores() {
        let batch = labelled(&[0.0, 0.0, 0.0, 0.0, 0.0, 5.0], &[0, 0, 0, 0, 0, 1]);
        let result = calibrate(&batch, &CostModel::default()).unwrap();
        assert!(result.threshold > 0.0);
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.confusion.true_positives, 1);
    }

    #[test]
    fn test_calibrated_threshold_is_positive_for_negative_scores() {
        let batch = labelled(&[-0.9, -0.8, -0.7, -0.1, -0.05], &[0, 0, 0, 1, 1]);
        let result = calibrate(&batch, &CostModel::default()).unwrap();
        assert_eq!(result.threshold, 0.001);
        // nothing scores above a positive threshold, so both anomalies are missed
        assert_eq!(result.confusion.false_negatives, 2);
    }

    #[test]
    fn test_fallback_threshold_raised_above_zero() {
        let calibrator = Calibrator::default();
        let batch = ingest(vec![-3.0, -2.0, -1.0], None).unwrap();
        assert_eq!(calibrator.fallback_threshold(&batch, 99.0), 0.001);
        let batch = ingest(vec![0.0; 4], None).unwrap();
        assert_eq!(calibrator.fallback_threshold(&batch, 99.0), 0.001);
    }

    #[test]
    fn test_select_threshold_prefers_supplied() {
        let batch = labelled(&[1.0, 20.0], &[0, 1]);
        let decision = select_threshold(
            &batch,
            &Calibrator::default(),
            &CostModel::default(),
            99.0,
            Some(4.0),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(decision.threshold, 4.0);
        assert_eq!(decision.policy, ThresholdPolicy::Supplied);
        assert!(!decision.validated());
    }

    #[test]
    fn test_calibration_config_validation() {
        assert!(CalibrationConfig::default().validate().is_ok());
        let bad = CalibrationConfig {
            fallback_percentile: 100.0,
            ..CalibrationConfig::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::InvalidPercentile(100.0)));
    }
}
