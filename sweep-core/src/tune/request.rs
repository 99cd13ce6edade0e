use serde::{Deserialize, Serialize};

use crate::sweep::{DataSource, EvalSettings, ParameterSpace};

use super::error::{TuneError, TuneResult};
use super::objective::{ObjectiveKind, Weights};

/// Upper bounds applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneLimits {
    /// Largest number of combinations a single round may enumerate.
    pub max_combinations: usize,
    pub max_rounds: usize,
}

impl Default for TuneLimits {
    fn default() -> Self {
        Self {
            max_combinations: 10_000,
            max_rounds: 20,
        }
    }
}

/// A validated auto-tune request. Immutable once a session has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTuneRequest {
    pub space: ParameterSpace,
    pub max_rounds: usize,
    pub values_per_param: usize,
    pub top_k: usize,
    pub objective: ObjectiveKind,
    pub weights: Weights,
    pub eval: EvalSettings,
    pub data_source: DataSource,
    /// Stop when the best score moves less than this between rounds.
    pub convergence_threshold: f64,
    /// Margin added on each side of the narrowed range, in units of the new step.
    pub margin_steps: f64,
}

impl AutoTuneRequest {
    pub fn new(space: ParameterSpace) -> Self {
        Self {
            space,
            max_rounds: 3,
            values_per_param: 5,
            top_k: 5,
            objective: ObjectiveKind::default(),
            weights: Weights::default(),
            eval: EvalSettings::default(),
            data_source: DataSource::default(),
            convergence_threshold: 0.001,
            margin_steps: 1.0,
        }
    }

    pub fn validate(&self, limits: &TuneLimits) -> TuneResult<()> {
        if self.max_rounds == 0 {
            return Err(TuneError::InvalidRequest(
                "max_rounds must be >= 1".to_string(),
            ));
        }
        if self.max_rounds > limits.max_rounds {
            return Err(TuneError::InvalidRequest(format!(
                "max_rounds {} exceeds the limit of {}",
                self.max_rounds, limits.max_rounds
            )));
        }
        if self.top_k == 0 {
            return Err(TuneError::InvalidRequest("top_k must be >= 1".to_string()));
        }
        if self.eval.iterations == 0 {
            return Err(TuneError::InvalidRequest(
                "iterations must be >= 1".to_string(),
            ));
        }
        if !self.convergence_threshold.is_finite() || self.convergence_threshold < 0.0 {
            return Err(TuneError::InvalidRequest(format!(
                "convergence_threshold must be >= 0, got {}",
                self.convergence_threshold
            )));
        }
        if !self.margin_steps.is_finite() || self.margin_steps < 0.0 {
            return Err(TuneError::InvalidRequest(format!(
                "margin_steps must be >= 0, got {}",
                self.margin_steps
            )));
        }
        if self.weights.iter().any(|(_, weight)| !weight.is_finite()) {
            return Err(TuneError::InvalidRequest(
                "weights must be finite".to_string(),
            ));
        }

        self.space
            .combination_count_within(self.values_per_param, limits.max_combinations)?;
        Ok(())
    }
}
