use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::space::Combination;

pub const ACCEPTANCE_RATE: &str = "acceptance_rate";
pub const NONZERO_CELLS: &str = "nonzero_cells";
pub const ACTIVE_TRACKS: &str = "active_tracks";
pub const ALIGNMENT_DEG: &str = "alignment_deg";
pub const MISALIGNMENT_RATIO: &str = "misalignment_ratio";

/// Raw statistics returned by one evaluator sample.
pub type SampleStats = BTreeMap<String, f64>;

/// Aggregate of one metric across the samples of a combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl MetricSummary {
    fn from_values(values: &mut [f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let count = values.len() as f64;
        let mean = values.iter().sum::<f64>() / count;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            min: values[0],
            max: values[values.len() - 1],
            p50: percentile(values, 0.50),
            p95: percentile(values, 0.95),
        })
    }
}

// linear interpolation between closest ranks, `sorted` must be ascending
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    let position = fraction * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Per-combination statistics aggregated over `iterations_per_combo` samples.
///
/// A failed combination carries the default value (zero samples, no
/// metrics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComboStats {
    pub samples: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
}

impl ComboStats {
    pub fn from_samples(samples: &[SampleStats]) -> Self {
        let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for sample in samples {
            for (name, value) in sample {
                if value.is_finite() {
                    columns.entry(name.as_str()).or_default().push(*value);
                }
            }
        }
        let metrics = columns
            .into_iter()
            .filter_map(|(name, mut values)| {
                MetricSummary::from_values(&mut values).map(|summary| (name.to_string(), summary))
            })
            .collect();
        Self {
            samples: samples.len(),
            metrics,
        }
    }

    pub fn mean(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(|summary| summary.mean)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(name, summary)| (name.clone(), summary.mean))
            .collect()
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.mean(ACCEPTANCE_RATE).unwrap_or(0.0)
    }

    pub fn nonzero_cells(&self) -> f64 {
        self.mean(NONZERO_CELLS).unwrap_or(0.0)
    }

    pub fn active_tracks(&self) -> f64 {
        self.mean(ACTIVE_TRACKS).unwrap_or(0.0)
    }

    pub fn alignment_deg(&self) -> f64 {
        self.mean(ALIGNMENT_DEG).unwrap_or(0.0)
    }

    pub fn misalignment_ratio(&self) -> f64 {
        self.mean(MISALIGNMENT_RATIO).unwrap_or(0.0)
    }
}

/// Outcome of evaluating one combination.
///
/// `index` is the enumeration position within its round and is the
/// tie-breaker for every ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboResult {
    pub index: usize,
    pub combination: Combination,
    pub stats: ComboStats,
    pub score: f64,
    pub error: Option<String>,
}

impl ComboResult {
    pub fn new(index: usize, combination: Combination, stats: ComboStats) -> Self {
        Self {
            index,
            combination,
            stats,
            score: 0.0,
            error: None,
        }
    }

    pub fn failed(index: usize, combination: Combination, error: impl Into<String>) -> Self {
        Self::new(index, combination, ComboStats::default()).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}
