//! Validity gate for regression observations
//!
//! A linear fit is only trusted when the observations cover the configured
//! utilization range roughly evenly. The range is cut into equal-width
//! buckets and every bucket must hold at least `min_mult` times the count of
//! the fullest one.

use crate::config::RegressionConfig;
use crate::error::{InsufficientData, SparseBucket};
use crate::models::ObservationPoint;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DataValidityChecker {
    start_percent: u32,
    end_percent: u32,
    bucket_size: u32,
    min_mult: f64,
}

impl DataValidityChecker {
    pub fn new(config: &RegressionConfig) -> Self {
        Self {
            start_percent: config.bucket_percent_start,
            end_percent: config.bucket_percent_end,
            bucket_size: config.bucket_size.max(1),
            min_mult: config.min_mult,
        }
    }

    /// Check one node's accumulated observations against its logical core
    /// count
    pub fn check(
        &self,
        node: &str,
        observations: &[ObservationPoint],
        cores: u32,
    ) -> Result<(), InsufficientData> {
        if observations.is_empty() || cores == 0 {
            return Err(InsufficientData::Empty {
                node: node.to_string(),
            });
        }

        let fractions: Vec<f64> = observations
            .iter()
            .map(|o| o.cpu / cores as f64)
            .collect();

        // diagnostic only
        info!(node, ks_statistic = ks_statistic(&fractions), "Kolmogorov-Smirnov statistic against Uniform(0,1)");

        let counts = self.bucket_counts(&fractions);
        let max_count = counts.iter().map(|(_, _, c)| *c).max().unwrap_or(0);
        debug!(node, max_count, "Largest bucket size");

        if max_count == 0 {
            warn!(
                node,
                start = self.start_percent,
                end = self.end_percent,
                "No samples inside the bucket range"
            );
            return Err(InsufficientData::OutOfRange {
                node: node.to_string(),
                start: self.start_percent,
                end: self.end_percent,
            });
        }

        let required = (max_count as f64 * self.min_mult) as usize;
        let sparse: Vec<SparseBucket> = counts
            .into_iter()
            .filter(|(_, _, count)| *count < required)
            .map(|(start_percent, end_percent, count)| {
                warn!(
                    node,
                    bucket = %format!("{start_percent}%-{end_percent}%"),
                    count,
                    required,
                    "Too few samples in bucket"
                );
                SparseBucket {
                    start_percent,
                    end_percent,
                    count,
                }
            })
            .collect();

        if sparse.is_empty() {
            Ok(())
        } else {
            Err(InsufficientData::SparseBuckets {
                node: node.to_string(),
                required,
                buckets: sparse,
            })
        }
    }

    /// `(start %, end %, count)` for every bucket in the range, each holding
    /// fractions with `start <= f < end`
    fn bucket_counts(&self, fractions: &[f64]) -> Vec<(u32, u32, usize)> {
        (self.start_percent..self.end_percent)
            .step_by(self.bucket_size as usize)
            .map(|lo| {
                let hi = lo + self.bucket_size;
                let (lo_f, hi_f) = (lo as f64 / 100.0, hi as f64 / 100.0);
                let count = fractions.iter().filter(|f| **f >= lo_f && **f < hi_f).count();
                (lo, hi, count)
            })
            .collect()
    }
}

/// One-sample Kolmogorov-Smirnov statistic `D_n` against Uniform(0,1).
///
/// Values outside `[0, 1]` are clamped before comparison.
pub fn ks_statistic(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = samples.iter().map(|s| s.clamp(0.0, 1.0)).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let above = (i + 1) as f64 / n - x;
            let below = x - i as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}
