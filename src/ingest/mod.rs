//! Score ingestion: validation and summary of oracle output.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("length mismatch: {scores} scores but {labels} labels")]
    LengthMismatch { scores: usize, labels: usize },

    #[error("empty batch")]
    EmptyBatch,

    #[error("non-finite score at sample {index}")]
    NonFiniteScore { index: usize },
}

/// Basic distribution summary of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// A validated, immutable batch of scores with optional ground truth.
///
/// Samples are indexed by their position in the input. Labels, when present,
/// are parallel to the scores (`true` = known anomalous).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBatch {
    scores: Vec<f64>,
    labels: Option<Vec<bool>>,
    summary: ScoreSummary,
}

impl ScoreBatch {
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn labels(&self) -> Option<&[bool]> {
        self.labels.as_deref()
    }

    pub fn has_labels(&self) -> bool {
        self.labels.is_some()
    }

    pub fn summary(&self) -> ScoreSummary {
        self.summary
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Always false for a batch built through [`ingest`].
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Iterate `(sample_index, score)` pairs in input order.
    pub fn samples(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.scores.iter().copied().enumerate()
    }

    /// Scores sorted ascending. NaN cannot occur in a validated batch.
    pub fn sorted_scores(&self) -> Vec<f64> {
        let mut sorted = self.scores.clone();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Validate raw scores (and optional labels) into a [`ScoreBatch`].
pub fn ingest(scores: Vec<f64>, labels: Option<Vec<bool>>) -> Result<ScoreBatch, ValidationError> {
    if scores.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }

    if let Some(labels) = &labels {
        if labels.len() != scores.len() {
            return Err(ValidationError::LengthMismatch {
                scores: scores.len(),
                labels: labels.len(),
            });
        }
    }

    if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
        return Err(ValidationError::NonFiniteScore { index });
    }

    let summary = summarize(&scores);
    tracing::debug!(
        count = summary.count,
        min = summary.min,
        max = summary.max,
        mean = summary.mean,
        labelled = labels.is_some(),
        "Ingested score batch"
    );

    Ok(ScoreBatch {
        scores,
        labels,
        summary,
    })
}

fn summarize(scores: &[f64]) -> ScoreSummary {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for &s in scores {
        min = min.min(s);
        max = max.max(s);
        sum += s;
    }
    ScoreSummary {
        count: scores.len(),
        min,
        max,
        mean: sum / scores.len() as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_summary() {
        let batch = ingest(vec![1.0, 2.0, 3.0, 10.0], None).unwrap();
        let s = batch.summary();
        assert_eq!(s.count, 4);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 10.0);
        assert_eq!(s.mean, 4.0);
        assert!(!batch.has_labels());
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert_eq!(ingest(vec![], None), Err(ValidationError::EmptyBatch));
        assert_eq!(ValidationError::EmptyBatch.to_string(), "empty batch");
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = ingest(vec![1.0, 2.0], Some(vec![true])).unwrap_err();
        assert_eq!(err, ValidationError::LengthMismatch { scores: 2, labels: 1 });
        assert!(err.to_string().starts_with("length mismatch"));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = ingest(vec![1.0, f64::NAN], None).unwrap_err();
        assert_eq!(err, ValidationError::NonFiniteScore { index: 1 });

        let err = ingest(vec![f64::INFINITY], None).unwrap_err();
        assert_eq!(err, ValidationError::NonFiniteScore { index: 0 });
        assert!(err.to_string().starts_with("non-finite score"));
    }

    #[test]
    fn test_samples_preserve_order() {
        let batch = ingest(vec![5.0, 1.0, 3.0], Some(vec![true, false, false])).unwrap();
        let samples: Vec<_> = batch.samples().collect();
        assert_eq!(samples, vec![(0, 5.0), (1, 1.0), (2, 3.0)]);
        assert_eq!(batch.sorted_scores(), vec![1.0, 3.0, 5.0]);
        assert_eq!(batch.labels(), Some(&[true, false, false][..]));
    }
}
