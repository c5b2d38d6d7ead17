//! Scoring oracle interface.
//!
//! The model that turns samples into anomaly scores lives outside this
//! crate; sessions only see it through [`ScoringOracle`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("scoring unavailable: {reason}")]
pub struct ScoringUnavailable {
    pub reason: String,
}

impl ScoringUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Produces one anomaly score per sample; higher means more anomalous.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score(&self, samples: &[Vec<f64>]) -> Result<Vec<f64>, ScoringUnavailable>;
}

/// Replays scores computed ahead of time, one per sample.
#[derive(Debug, Clone, Default)]
pub struct StaticScores {
    scores: Vec<f64>,
}

impl StaticScores {
    pub fn new(scores: Vec<f64>) -> Self {
        Self { scores }
    }
}

#[async_trait]
impl ScoringOracle for StaticScores {
    async fn score(&self, samples: &[Vec<f64>]) -> Result<Vec<f64>, ScoringUnavailable> {
        if samples.len() != self.scores.len() {
            return Err(ScoringUnavailable::new(format!(
                "{} samples submitted but {} scores recorded",
                samples.len(),
                self.scores.len()
            )));
        }
        Ok(self.scores.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_scores_replay() {
        let oracle = StaticScores::new(vec![0.2, 0.9]);
        let scores = oracle.score(&[vec![1.0], vec![2.0]]).await.unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[tokio::test]
    async fn test_static_scores_count_mismatch() {
        let oracle = StaticScores::new(vec![0.2]);
        let err = oracle.score(&[]).await.unwrap_err();
        assert!(err.to_string().starts_with("scoring unavailable"));
    }
}
