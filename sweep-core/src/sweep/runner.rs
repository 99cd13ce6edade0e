use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use super::cancel::CancelToken;
use super::error::SweepResult;
use super::evaluator::{ComboEvaluator, EvalSettings, EvaluatorError, PipelineEvaluator};
use super::result::ComboResult;
use super::space::{Combination, ParameterSpace};

/// Live progress of one sweep, readable from any thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepProgress {
    pub completed: usize,
    pub total: usize,
    pub results: Vec<ComboResult>,
}

pub type SharedProgress = Arc<RwLock<SweepProgress>>;

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Results in enumeration order; partial when cancelled or aborted.
    pub results: Vec<ComboResult>,
    pub total: usize,
    pub cancelled: bool,
    pub fatal: Option<EvaluatorError>,
}

impl SweepOutcome {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.fatal.is_none() && self.results.len() == self.total
    }
}

/// Messages emitted by a running sweep, in order.
#[derive(Debug, Clone)]
pub enum SweepEvent {
    Started { total: usize },
    ComboCompleted(ComboResult),
    Finished(SweepOutcome),
}

/// Evaluates every combination of a parameter space, one at a time.
///
/// Combinations are never evaluated concurrently: the pipeline behind the
/// evaluator holds shared state that each combination resets.
#[derive(Clone)]
pub struct SweepRunner {
    combo: ComboEvaluator,
}

impl SweepRunner {
    pub fn new(evaluator: Arc<dyn PipelineEvaluator>, settings: EvalSettings) -> Self {
        Self {
            combo: ComboEvaluator::new(evaluator, settings),
        }
    }

    pub fn settings(&self) -> &EvalSettings {
        self.combo.settings()
    }

    /// Enumerates `space` and evaluates it on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        space: &ParameterSpace,
        values_per_param: usize,
    ) -> SweepResult<SweepHandle> {
        self.start_with_cancel(space, values_per_param, CancelToken::new())
    }

    pub fn start_with_cancel(
        &self,
        space: &ParameterSpace,
        values_per_param: usize,
        cancel: CancelToken,
    ) -> SweepResult<SweepHandle> {
        let combinations = space.enumerate(values_per_param)?;
        let progress: SharedProgress = Arc::new(RwLock::new(SweepProgress {
            total: combinations.len(),
            ..Default::default()
        }));
        let (sender, events) = mpsc::unbounded_channel();

        let runner = self.clone();
        let task_progress = Arc::clone(&progress);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = runner
                .run(combinations, &task_cancel, &task_progress, Some(&sender))
                .await;
            let _ = sender.send(SweepEvent::Finished(outcome.clone()));
            outcome
        });

        Ok(SweepHandle {
            progress,
            cancel,
            events,
            task,
        })
    }

    /// Evaluates `combinations` sequentially on the current task.
    ///
    /// Cancellation is checked between combinations; the one in flight is
    /// finished and kept. A fatal evaluator error stops the sweep and keeps
    /// everything collected so far.
    pub async fn run(
        &self,
        combinations: Vec<Combination>,
        cancel: &CancelToken,
        progress: &SharedProgress,
        events: Option<&mpsc::UnboundedSender<SweepEvent>>,
    ) -> SweepOutcome {
        let total = combinations.len();
        let started = Instant::now();
        {
            let mut guard = progress.write().unwrap_or_else(PoisonError::into_inner);
            guard.total = total;
        }
        emit(events, SweepEvent::Started { total });

        let mut outcome = SweepOutcome {
            results: Vec::with_capacity(total),
            total,
            cancelled: false,
            fatal: None,
        };
        if total == 0 {
            return outcome;
        }

        info!(
            target: "sweep.runner",
            combinations = total,
            iterations = self.combo.settings().iterations,
            "sweep started"
        );

        for (index, combination) in combinations.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let result = match self.combo.evaluate(index, combination).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        target: "sweep.runner",
                        combo = index,
                        error = %err,
                        "fatal evaluator error, aborting sweep"
                    );
                    outcome.fatal = Some(err);
                    break;
                }
            };

            {
                let mut guard = progress.write().unwrap_or_else(PoisonError::into_inner);
                guard.results.push(result.clone());
                guard.completed = guard.results.len();
            }
            emit(events, SweepEvent::ComboCompleted(result.clone()));
            outcome.results.push(result);
        }

        if !outcome.cancelled && outcome.fatal.is_none() && cancel.is_cancelled() {
            // cancelled while the last combination was in flight
            outcome.cancelled = outcome.results.len() < total;
        }

        info!(
            target: "sweep.runner",
            completed = outcome.results.len(),
            total,
            cancelled = outcome.cancelled,
            failed = outcome.results.iter().filter(|r| !r.is_valid()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        outcome
    }
}

fn emit(events: Option<&mpsc::UnboundedSender<SweepEvent>>, event: SweepEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}

/// Handle to a sweep running on a background task.
pub struct SweepHandle {
    progress: SharedProgress,
    cancel: CancelToken,
    events: mpsc::UnboundedReceiver<SweepEvent>,
    task: JoinHandle<SweepOutcome>,
}

impl SweepHandle {
    pub fn status(&self) -> SweepProgress {
        self.progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops after the combination currently in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next progress message; `None` once the sweep task has gone away.
    pub async fn next_event(&mut self) -> Option<SweepEvent> {
        self.events.recv().await
    }

    pub async fn wait(self) -> Result<SweepOutcome, JoinError> {
        self.task.await
    }
}
