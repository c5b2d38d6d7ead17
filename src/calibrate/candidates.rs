//! Candidate threshold generation.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on percentile ladder rungs.
pub const MAX_LADDER: f64 = 10_000.0;

/// Shape of the threshold search space.
///
/// The low sweep covers aggressive thresholds below the usual score range;
/// the percentile ladder walks the upper half of the observed distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateGrid {
    pub low_sweep_start: f64,
    pub low_sweep_end: f64,
    pub low_sweep_steps: usize,
    /// First percentile on the ladder (inclusive).
    pub percentile_start: f64,
    /// Ladder step; the ladder stops before the 100th percentile.
    pub percentile_step: f64,
}

impl Default for CandidateGrid {
    fn default() -> Self {
        Self {
            low_sweep_start: 0.001,
            low_sweep_end: 0.1,
            low_sweep_steps: 10,
            percentile_start: 50.0,
            percentile_step: 0.5,
        }
    }
}

impl CandidateGrid {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.low_sweep_start.is_finite()
            || !self.low_sweep_end.is_finite()
            || self.low_sweep_start <= 0.0
            || self.low_sweep_end < self.low_sweep_start
        {
            return Err(ConfigError::InvalidGrid(format!(
                "low sweep [{}, {}] is not a finite positive ascending range",
                self.low_sweep_start, self.low_sweep_end
            )));
        }
        if self.low_sweep_steps == 0 {
            return Err(ConfigError::InvalidGrid("low_sweep_steps must be >= 1".into()));
        }
        if !(0.0..100.0).contains(&self.percentile_start) {
            return Err(ConfigError::InvalidGrid(format!(
                "percentile_start {} outside [0, 100)",
                self.percentile_start
            )));
        }
        if !(self.percentile_step.is_finite() && self.percentile_step > 0.0) {
            return Err(ConfigError::InvalidGrid(format!(
                "percentile_step {} must be > 0",
                self.percentile_step
            )));
        }
        if (100.0 - self.percentile_start) / self.percentile_step > MAX_LADDER {
            return Err(ConfigError::InvalidGrid(format!(
                "percentile_step {} yields more than {} ladder rungs",
                self.percentile_step, MAX_LADDER
            )));
        }
        Ok(())
    }

    /// Build the deduplicated, ascending candidate set for `sorted` scores.
    ///
    /// Only positive values are kept; a threshold of zero or below is never
    /// a candidate.
    pub fn candidates(&self, sorted: &[f64]) -> Vec<f64> {
        let mut out = linspace(self.low_sweep_start, self.low_sweep_end, self.low_sweep_steps);

        let mut i = 0usize;
        loop {
            let p = self.percentile_start + i as f64 * self.percentile_step;
            if p >= 100.0 {
                break;
            }
            if let Some(v) = percentile(sorted, p) {
                out.push(v);
            }
            i += 1;
        }

        out.retain(|t| *t > 0.0);
        out.sort_by(f64::total_cmp);
        out.dedup();
        out
    }
}

/// `steps` evenly spaced values over `[start, end]`.
fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let width = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + width * i as f64).collect()
        }
    }
}

/// Linear-interpolated percentile of an ascending slice.
///
/// `p` is in `[0, 100]`; rank `p/100 * (n-1)` is interpolated between its
/// neighbouring order statistics. Returns `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 10.0, 11.0, 12.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 100.0), Some(12.0));
        // rank 2.5 sits halfway between 3 and 10
        assert_eq!(percentile(&sorted, 50.0), Some(6.5));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[4.0], 99.0), Some(4.0));
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 1.0, 0), Vec::<f64>::new());
        assert_eq!(linspace(0.5, 1.0, 1), vec![0.5]);
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_candidates_sorted_and_unique() {
        let grid = CandidateGrid::default();
        let sorted: Vec<f64> = (1..=200).map(|v| v as f64).collect();
        let c = grid.candidates(&sorted);
        assert!(c.windows(2).all(|w| w[0] < w[1]));
        // 10 sweep values + percentiles 50.0..=99.5 in 0.5 steps
        assert_eq!(c.len(), 10 + 100);
        assert_eq!(c[0], 0.001);
        assert!(*c.last().unwrap() < 200.0);
    }

    #[test]
    fn test_candidates_collapse_on_constant_scores() {
        let grid = CandidateGrid::default();
        let c = grid.candidates(&[7.0; 50]);
        assert_eq!(c.len(), 11);
        assert_eq!(*c.last().unwrap(), 7.0);
    }

    #[test]
    fn test_grid_validation() {
        assert!(CandidateGrid::default().validate().is_ok());
        let bad = CandidateGrid {
            percentile_step: 0.0,
            ..CandidateGrid::default()
        };
        assert!(bad.validate().is_err());
        let bad = CandidateGrid {
            percentile_start: 100.0,
            ..CandidateGrid::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_candidates_drop_non_positive_values() {
        let grid = CandidateGrid::default();
        let c = grid.candidates(&[-0.9, -0.8, -0.7, -0.1, -0.05]);
        assert_eq!(c.len(), 10);
        assert!(c.iter().all(|t| *t > 0.0));

        let c = grid.candidates(&[0.0, 0.0, 0.0, 0.0, 0.0, 5.0]);
        assert!(c.iter().all(|t| *t > 0.0));
        // rank 4.975 of six scores interpolates between 0.0 and 5.0
        assert!((c.last().unwrap() - 4.875).abs() < 1e-9);
    }

    #[test]
    fn test_grid_rejects_degenerate_sweep() {
        let zero_steps = CandidateGrid {
            low_sweep_steps: 0,
            ..CandidateGrid::default()
        };
        assert!(matches!(zero_steps.validate(), Err(ConfigError::InvalidGrid(_))));

        let zero_start = CandidateGrid {
            low_sweep_start: 0.0,
            ..CandidateGrid::default()
        };
        assert!(matches!(zero_start.validate(), Err(ConfigError::InvalidGrid(_))));
    }

    #[test]
    fn test_grid_rejects_oversized_ladder() {
        let tiny_step = CandidateGrid {
            percentile_step: 1e-9,
            ..CandidateGrid::default()
        };
        assert!(matches!(tiny_step.validate(), Err(ConfigError::InvalidGrid(_))));

        let at_cap = CandidateGrid {
            percentile_start: 0.0,
            percentile_step: 0.01,
            ..CandidateGrid::default()
        };
        assert!(at_cap.validate().is_ok());
    }
}
