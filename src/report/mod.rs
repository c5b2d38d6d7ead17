//! Triage report assembly: rank anomalies and summarise the decision.

pub mod render;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calibrate::{CalibrationResult, CostModel, ThresholdDecision, ThresholdPolicy};
use crate::classify::{DetectedAnomaly, Severity};
use crate::ingest::ScoreSummary;

/// Cost of the errors made at the chosen threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub fp_cost: f64,
    pub fn_cost: f64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub false_positive_cost: f64,
    pub false_negative_cost: f64,
    pub total: f64,
}

impl CostBreakdown {
    fn from_calibration(result: &CalibrationResult, cost: &CostModel) -> Self {
        let fp = result.confusion.false_positives;
        let fns = result.confusion.false_negatives;
        let false_positive_cost = fp as f64 * cost.fp_cost;
        let false_negative_cost = fns as f64 * cost.fn_cost;
        Self {
            fp_cost: cost.fp_cost,
            fn_cost: cost.fn_cost,
            false_positives: fp,
            false_negatives: fns,
            false_positive_cost,
            false_negative_cost,
            total: false_positive_cost + false_negative_cost,
        }
    }
}

/// Final, immutable result of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub session_id: Uuid,
    pub total_samples: usize,
    pub anomaly_count: usize,
    pub threshold_used: f64,
    pub threshold_policy: ThresholdPolicy,
    pub threshold_validated: bool,
    /// Present only when ground truth was available.
    pub cost_breakdown: Option<CostBreakdown>,
    pub calibration: Option<CalibrationResult>,
    pub score_summary: ScoreSummary,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub top_ranked: Vec<DetectedAnomaly>,
}

/// Everything about the session the report needs besides the samples.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub session_id: Uuid,
    pub decision: ThresholdDecision,
    pub cost: CostModel,
    pub summary: ScoreSummary,
}

/// Rank order: severity descending, then score descending, then sample index ascending.
pub fn rank(a: &DetectedAnomaly, b: &DetectedAnomaly) -> std::cmp::Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| a.sample_index.cmp(&b.sample_index))
}

/// Build the triage report for one session.
///
/// `classified` holds every sample, Benign included; `top_n` bounds only the
/// detail list, never `anomaly_count`.
pub fn build(classified: &[DetectedAnomaly], context: &ReportContext, top_n: usize) -> AnomalyReport {
    let mut anomalies: Vec<DetectedAnomaly> = classified
        .iter()
        .filter(|a| a.severity.is_anomalous())
        .cloned()
        .collect();

    let mut severity_counts = BTreeMap::new();
    for a in &anomalies {
        *severity_counts.entry(a.severity).or_insert(0usize) += 1;
    }

    let anomaly_count = anomalies.len();
    anomalies.sort_by(rank);
    anomalies.truncate(top_n);

    let calibration = context.decision.calibration.clone();
    let cost_breakdown = calibration
        .as_ref()
        .map(|c| CostBreakdown::from_calibration(c, &context.cost));

    AnomalyReport {
        session_id: context.session_id,
        total_samples: classified.len(),
        anomaly_count,
        threshold_used: context.decision.threshold,
        threshold_policy: context.decision.policy,
        threshold_validated: context.decision.validated(),
        cost_breakdown,
        calibration,
        score_summary: context.summary,
        severity_counts,
        top_ranked: anomalies,
    }
}
