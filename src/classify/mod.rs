//! Threshold application and severity tiering.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::ingest::ScoreBatch;

/// Severity tiers, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Benign,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn is_anomalous(self) -> bool {
        self != Severity::Benign
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Benign => "Benign",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Benign" => Ok(Severity::Benign),
            "Low" => Ok(Severity::Low),
            "Medium" => Ok(Severity::Medium),
            "High" => Ok(Severity::High),
            "Critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Lower bounds of each tier, as multiples of the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityTiers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityTiers {
    fn default() -> Self {
        Self {
            low: 1.0,
            medium: 1.5,
            high: 2.0,
            critical: 3.0,
        }
    }
}

impl SeverityTiers {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ascending = self.low == 1.0
            && self.low < self.medium
            && self.medium < self.high
            && self.high < self.critical
            && self.critical.is_finite();
        if ascending {
            Ok(())
        } else {
            Err(ConfigError::InvalidTiers)
        }
    }

    /// Tier for a `score / threshold` ratio.
    pub fn tier(&self, ratio: f64) -> Severity {
        if ratio >= self.critical {
            Severity::Critical
        } else if ratio >= self.high {
            Severity::High
        } else if ratio >= self.medium {
            Severity::Medium
        } else if ratio >= self.low {
            Severity::Low
        } else {
            Severity::Benign
        }
    }
}

/// One sample after thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedSample {
    pub sample_index: usize,
    pub score: f64,
    pub severity: Severity,
}

impl ClassifiedSample {
    pub fn into_anomaly(self, session_id: Uuid) -> DetectedAnomaly {
        DetectedAnomaly {
            sample_index: self.sample_index,
            score: self.score,
            severity: self.severity,
            session_id,
        }
    }
}

/// A classified sample owned by the session that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedAnomaly {
    pub sample_index: usize,
    pub score: f64,
    pub severity: Severity,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    tiers: SeverityTiers,
}

impl Classifier {
    pub fn new(tiers: SeverityTiers) -> Result<Self, ConfigError> {
        tiers.validate()?;
        Ok(Self { tiers })
    }

    /// Label every sample of `batch`, in input order.
    ///
    /// A sample is anomalous only when `score > threshold`; a score exactly at
    /// the threshold stays Benign even though its ratio is 1.
    pub fn classify(
        &self,
        batch: &ScoreBatch,
        threshold: f64,
    ) -> Result<Vec<ClassifiedSample>, ConfigError> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ConfigError::NonPositiveThreshold(threshold));
        }

        Ok(batch
            .samples()
            .map(|(sample_index, score)| {
                let severity = if score > threshold {
                    self.tiers.tier(score / threshold)
                } else {
                    Severity::Benign
                };
                ClassifiedSample {
                    sample_index,
                    score,
                    severity,
                }
            })
            .collect())
    }
}

/// Classify with the default tier boundaries.
pub fn classify(batch: &ScoreBatch, threshold: f64) -> Result<Vec<ClassifiedSample>, ConfigError> {
    Classifier::default().classify(batch, threshold)
}
