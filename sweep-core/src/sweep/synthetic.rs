//! Deterministic stand-in for the sensor pipeline.
//!
//! Acceptance peaks at a configured optimum and decays with the scaled
//! distance from it; misalignment grows with the same distance. Every run
//! with the same seed and inputs produces the same samples.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::evaluator::{DataSource, EvalResult, EvaluatorError, PipelineEvaluator};
use super::result::{
    SampleStats, ACCEPTANCE_RATE, ACTIVE_TRACKS, ALIGNMENT_DEG, MISALIGNMENT_RATIO, NONZERO_CELLS,
};
use super::space::Combination;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub seed: u64,
    /// Amplitude of the uniform noise added to every sample.
    pub noise: f64,
    /// Probability that applying a combination is rejected.
    pub failure_rate: f64,
    pub optimum: BTreeMap<String, f64>,
    /// Distance scale per parameter; missing entries use 1.0.
    pub scale: BTreeMap<String, f64>,
    /// Source names that fail to open.
    pub unavailable_sources: Vec<String>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            noise: 0.0,
            failure_rate: 0.0,
            optimum: BTreeMap::new(),
            scale: BTreeMap::new(),
            unavailable_sources: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct SyntheticState {
    rng: ChaCha8Rng,
    distance: Option<f64>,
    noise: f64,
}

#[derive(Debug)]
pub struct SyntheticEvaluator {
    config: SyntheticConfig,
    state: Mutex<SyntheticState>,
}

impl SyntheticEvaluator {
    pub fn new(config: SyntheticConfig) -> Self {
        let state = SyntheticState {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            distance: None,
            noise: config.noise,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Scaled euclidean distance between `params` and the optimum.
    pub fn distance(&self, params: &Combination) -> f64 {
        self.config
            .optimum
            .iter()
            .filter_map(|(name, optimum)| {
                let value = params.get(name)?.as_f64();
                let scale = self
                    .config
                    .scale
                    .get(name)
                    .copied()
                    .filter(|scale| *scale > 0.0)
                    .unwrap_or(1.0);
                Some(((value - optimum) / scale).powi(2))
            })
            .sum::<f64>()
            .sqrt()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyntheticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PipelineEvaluator for SyntheticEvaluator {
    async fn open_source(&self, source: &DataSource) -> EvalResult<()> {
        if self
            .config
            .unavailable_sources
            .iter()
            .any(|name| name == &source.name)
        {
            return Err(EvaluatorError::SourceUnavailable(source.name.clone()));
        }
        let mut state = self.lock();
        state.rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        // a primed background model halves the sample noise
        state.noise = if source.seed {
            self.config.noise / 2.0
        } else {
            self.config.noise
        };
        debug!(
            target: "sweep.evaluator",
            source = %source.name,
            seeded = source.seed,
            "synthetic source opened"
        );
        Ok(())
    }

    async fn reset(&self) -> EvalResult<()> {
        self.lock().distance = None;
        Ok(())
    }

    async fn apply_params(&self, params: &Combination) -> EvalResult<()> {
        let distance = self.distance(params);
        let mut state = self.lock();
        if self.config.failure_rate > 0.0 && state.rng.gen::<f64>() < self.config.failure_rate {
            return Err(EvaluatorError::Apply(format!(
                "synthetic rejection of {}",
                params.display()
            )));
        }
        state.distance = Some(distance);
        Ok(())
    }

    async fn sample_iteration(&self) -> EvalResult<SampleStats> {
        let mut state = self.lock();
        let distance = state
            .distance
            .ok_or_else(|| EvaluatorError::Sample("no parameters applied".to_string()))?;
        let noise = state.noise;
        let mut jitter = |amplitude: f64| {
            if amplitude > 0.0 {
                state.rng.gen_range(-amplitude..=amplitude)
            } else {
                0.0
            }
        };

        let quality = (-distance * distance).exp();
        let acceptance = (0.95 * quality + jitter(noise)).clamp(0.0, 1.0);
        let misalignment = (0.5 * (1.0 - quality) + jitter(noise)).clamp(0.0, 1.0);
        let alignment = (2.0 + 10.0 * distance + jitter(noise * 10.0)).max(0.0);

        let mut stats = SampleStats::new();
        stats.insert(ACCEPTANCE_RATE.to_string(), acceptance);
        stats.insert(MISALIGNMENT_RATIO.to_string(), misalignment);
        stats.insert(ALIGNMENT_DEG.to_string(), alignment);
        stats.insert(ACTIVE_TRACKS.to_string(), (20.0 * acceptance).round());
        stats.insert(NONZERO_CELLS.to_string(), (1000.0 + 500.0 * distance).round());
        Ok(stats)
    }
}
