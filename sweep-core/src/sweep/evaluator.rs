//! Boundary to the sensor processing pipeline.
//!
//! The pipeline keeps shared mutable state (background model, clusters,
//! tracks), so every combination goes through the same explicit protocol:
//! reset, apply, settle, then sample a fixed number of iterations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::duration::serde_duration;

use super::result::{ComboResult, ComboStats, SampleStats};
use super::space::Combination;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluatorError {
    #[error("pipeline reset failed: {0}")]
    Reset(String),
    #[error("parameters rejected: {0}")]
    Apply(String),
    #[error("sample failed: {0}")]
    Sample(String),
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
}

impl EvaluatorError {
    /// Fatal errors abort the whole session instead of a single combination.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvaluatorError::SourceUnavailable(_))
    }
}

pub type EvalResult<T> = std::result::Result<T, EvaluatorError>;

/// Live or recorded sensor feed the evaluator replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    /// Prime the background model from the source before the first sample.
    pub seed: bool,
}

impl DataSource {
    pub fn new(name: impl Into<String>, seed: bool) -> Self {
        Self {
            name: name.into(),
            seed,
        }
    }
}

/// Pipeline evaluator consumed by the sweep engine.
///
/// Implementations must not leak state from one combination into the next
/// once `reset` has returned.
#[async_trait]
pub trait PipelineEvaluator: Send + Sync {
    /// Called once per session before the first combination.
    async fn open_source(&self, _source: &DataSource) -> EvalResult<()> {
        Ok(())
    }

    async fn reset(&self) -> EvalResult<()>;

    async fn apply_params(&self, params: &Combination) -> EvalResult<()>;

    async fn wait_settle(&self, duration: Duration) {
        sleep(duration).await;
    }

    async fn sample_iteration(&self) -> EvalResult<SampleStats>;
}

/// How each combination is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSettings {
    pub iterations: usize,
    #[serde(with = "serde_duration")]
    pub settle_time: Duration,
    #[serde(with = "serde_duration")]
    pub sample_interval: Duration,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            iterations: 10,
            settle_time: Duration::from_secs(5),
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// Runs the evaluator protocol for a single combination and aggregates the
/// samples into one [`ComboResult`].
#[derive(Clone)]
pub struct ComboEvaluator {
    evaluator: Arc<dyn PipelineEvaluator>,
    settings: EvalSettings,
}

impl ComboEvaluator {
    pub fn new(evaluator: Arc<dyn PipelineEvaluator>, settings: EvalSettings) -> Self {
        Self {
            evaluator,
            settings,
        }
    }

    pub fn settings(&self) -> &EvalSettings {
        &self.settings
    }

    /// Evaluates one combination.
    ///
    /// Non-fatal failures are recorded on the returned result; only fatal
    /// errors are returned as `Err`. Nothing is retried.
    pub async fn evaluate(
        &self,
        index: usize,
        combination: &Combination,
    ) -> EvalResult<ComboResult> {
        match self.run_protocol(combination).await {
            Ok(samples) => {
                let stats = ComboStats::from_samples(&samples);
                debug!(
                    target: "sweep.evaluator",
                    combo = index,
                    params = %combination.display(),
                    samples = stats.samples,
                    "combination evaluated"
                );
                Ok(ComboResult::new(index, combination.clone(), stats))
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(
                    target: "sweep.evaluator",
                    combo = index,
                    params = %combination.display(),
                    error = %err,
                    "combination failed"
                );
                Ok(ComboResult::failed(index, combination.clone(), err.to_string()))
            }
        }
    }

    async fn run_protocol(&self, combination: &Combination) -> EvalResult<Vec<SampleStats>> {
        self.evaluator.reset().await?;
        self.evaluator.apply_params(combination).await?;
        self.evaluator.wait_settle(self.settings.settle_time).await;

        let mut samples = Vec::with_capacity(self.settings.iterations);
        for iteration in 0..self.settings.iterations {
            if iteration > 0 && !self.settings.sample_interval.is_zero() {
                sleep(self.settings.sample_interval).await;
            }
            samples.push(self.evaluator.sample_iteration().await?);
        }
        Ok(samples)
    }
}
