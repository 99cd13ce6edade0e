//! Multi-round auto-tune controller.
//!
//! Each round sweeps the current parameter space, scores the results,
//! records a [`RoundSummary`] and narrows the space around the top-K before
//! the next round. The controller reacts to the runner's completion
//! messages; progress is published through a [`StatusReporter`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sweep::{
    CancelToken, ComboResult, ParameterSpace, PipelineEvaluator, SweepEvent, SweepRunner,
};

use super::objective::{ObjectiveKind, ObjectiveScorer};
use super::request::{AutoTuneRequest, TuneLimits};
use super::status::{
    Recommendation, RoundSummary, SessionMode, StatusReporter, Termination, TunerPhase,
};

/// Final result of a tuning session.
#[derive(Debug, Clone)]
pub struct TuneOutcome {
    pub session_id: Uuid,
    pub mode: SessionMode,
    pub termination: Termination,
    pub rounds: Vec<RoundSummary>,
    pub recommendation: Option<Recommendation>,
    pub pareto_front: Vec<ComboResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

struct RoundRun {
    results: Vec<ComboResult>,
    cancelled: bool,
    fatal: Option<String>,
}

#[derive(Default)]
struct SessionState {
    rounds: Vec<RoundSummary>,
    best: Option<(ComboResult, usize)>,
    scored: Vec<ComboResult>,
}

impl SessionState {
    /// Folds a round's results into the global best. Only a strictly
    /// higher score replaces it, so earlier rounds win ties.
    fn observe(&mut self, round: usize, results: &[ComboResult], scorer: &ObjectiveScorer) {
        if let Some(candidate) = scorer.best(results) {
            let improves = self
                .best
                .as_ref()
                .map_or(true, |(best, _)| candidate.score > best.score);
            if improves {
                self.best = Some((candidate, round));
            }
        }
        self.scored
            .extend(results.iter().filter(|result| result.is_valid()).cloned());
    }
}

pub struct AutoTuner {
    session_id: Uuid,
    mode: SessionMode,
    request: AutoTuneRequest,
    limits: TuneLimits,
    evaluator: Arc<dyn PipelineEvaluator>,
    runner: SweepRunner,
    scorer: ObjectiveScorer,
    reporter: StatusReporter,
    cancel: CancelToken,
}

impl AutoTuner {
    pub fn new(evaluator: Arc<dyn PipelineEvaluator>, request: AutoTuneRequest) -> Self {
        let runner = SweepRunner::new(Arc::clone(&evaluator), request.eval.clone());
        let scorer = ObjectiveScorer::new(request.objective, request.weights.clone());
        Self {
            session_id: Uuid::new_v4(),
            mode: SessionMode::Auto,
            request,
            limits: TuneLimits::default(),
            evaluator,
            runner,
            scorer,
            reporter: StatusReporter::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid, mode: SessionMode) -> Self {
        self.session_id = session_id;
        self.mode = mode;
        self
    }

    /// Limits re-checked against every narrowed space.
    pub fn with_limits(mut self, limits: TuneLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> TuneOutcome {
        let started_at = Utc::now();
        self.reporter
            .begin_session(self.session_id, self.mode, self.request.max_rounds);
        info!(
            target: "tune.engine",
            session = %self.session_id,
            mode = self.mode.as_str(),
            params = self.request.space.len(),
            max_rounds = self.request.max_rounds,
            values_per_param = self.request.values_per_param,
            objective = %self.request.objective,
            "tuning session started"
        );

        let mut state = SessionState::default();
        let (termination, error) = self.drive(&mut state).await;
        self.finish(state, termination, error, started_at)
    }

    async fn drive(&self, state: &mut SessionState) -> (Termination, Option<String>) {
        let source = &self.request.data_source;
        if let Err(err) = self.evaluator.open_source(source).await {
            return (Termination::Failed, Some(err.to_string()));
        }

        let hard = self.request.space.clone();
        let mut space = hard.clone();
        let mut previous_best: Option<f64> = None;

        for round in 1..=self.request.max_rounds {
            if self.cancel.is_cancelled() {
                return (Termination::Cancelled, None);
            }

            let started_at = Utc::now();
            let run = match self.run_round(round, &space).await {
                Ok(run) => run,
                Err(reason) => return (Termination::Failed, Some(reason)),
            };
            state.observe(round, &run.results, &self.scorer);
            if let Some(reason) = run.fatal {
                return (Termination::Failed, Some(reason));
            }
            if run.cancelled {
                return (Termination::Cancelled, None);
            }

            self.reporter.set_phase(TunerPhase::RoundScoring(round));
            let Some(best) = self.scorer.best(&run.results) else {
                return (
                    Termination::Failed,
                    Some(format!(
                        "round {round}: all {} combinations failed",
                        run.results.len()
                    )),
                );
            };
            info!(
                target: "tune.engine",
                session = %self.session_id,
                round,
                best_score = best.score,
                best_params = %best.combination.display(),
                "round scored"
            );

            let summary = RoundSummary {
                round,
                space: space.clone(),
                results: run.results.clone(),
                best: best.clone(),
                started_at,
                ended_at: Utc::now(),
            };
            self.reporter.complete_round(summary.clone());
            state.rounds.push(summary);

            self.reporter.set_phase(TunerPhase::Narrowing(round));
            if round == self.request.max_rounds {
                return (Termination::Exhausted, None);
            }
            if let Some(previous) = previous_best {
                let delta = best.score - previous;
                if delta.abs() < self.request.convergence_threshold {
                    debug!(target: "tune.engine", round, delta, "best score settled");
                    return (Termination::Converged, None);
                }
            }
            previous_best = Some(best.score);

            let top = self.scorer.top_k(&run.results, self.request.top_k);
            space = match self.narrow(&space, &top, &hard) {
                Ok(next) => next,
                Err(reason) => {
                    return (
                        Termination::Failed,
                        Some(format!("round {}: {reason}", round + 1)),
                    )
                }
            };
        }

        (Termination::Exhausted, None)
    }

    async fn run_round(&self, round: usize, space: &ParameterSpace) -> Result<RoundRun, String> {
        let values_per_param = self.request.values_per_param;
        let total = space
            .combination_count(values_per_param)
            .map_err(|err| err.to_string())?;
        self.reporter.begin_round(round, total);
        info!(
            target: "tune.engine",
            session = %self.session_id,
            round,
            combinations = total,
            "round started"
        );

        let mut handle = self
            .runner
            .start_with_cancel(space, values_per_param, self.cancel.clone())
            .map_err(|err| err.to_string())?;

        let mut finished = None;
        while let Some(event) = handle.next_event().await {
            match event {
                SweepEvent::Started { .. } => {}
                SweepEvent::ComboCompleted(result) => {
                    self.reporter.record_combo(self.scorer.score_result(result));
                }
                SweepEvent::Finished(outcome) => {
                    finished = Some(outcome);
                    break;
                }
            }
        }
        let outcome = match finished {
            Some(outcome) => outcome,
            None => handle
                .wait()
                .await
                .map_err(|err| format!("round {round}: sweep task failed: {err}"))?,
        };

        Ok(RoundRun {
            results: self.scorer.score_results(outcome.results),
            cancelled: outcome.cancelled,
            fatal: outcome.fatal.map(|err| err.to_string()),
        })
    }

    fn narrow(
        &self,
        space: &ParameterSpace,
        top: &[ComboResult],
        hard: &ParameterSpace,
    ) -> Result<ParameterSpace, String> {
        let next = space
            .narrow(
                top,
                self.request.values_per_param,
                self.request.margin_steps,
                Some(hard),
            )
            .map_err(|err| err.to_string())?;
        // narrowed ranges can hold more samples than a grid-capped first round
        next.combination_count_within(
            self.request.values_per_param,
            self.limits.max_combinations,
        )
        .map_err(|err| err.to_string())?;
        debug!(
            target: "tune.engine",
            session = %self.session_id,
            top_k = top.len(),
            bounds = ?next.bounds(),
            "parameter space narrowed"
        );
        Ok(next)
    }

    fn finish(
        self,
        state: SessionState,
        termination: Termination,
        error: Option<String>,
        started_at: DateTime<Utc>,
    ) -> TuneOutcome {
        let recommendation = state.best.map(|(result, round)| Recommendation {
            result,
            round,
            objective: self.scorer.kind(),
            weights: self.scorer.weights().clone(),
        });
        let pareto_front = match self.scorer.kind() {
            ObjectiveKind::Pareto => self.scorer.pareto_front(&state.scored),
            ObjectiveKind::Acceptance | ObjectiveKind::Weighted => Vec::new(),
        };
        self.reporter.finish(
            termination,
            recommendation.clone(),
            pareto_front.clone(),
            error.clone(),
        );

        let best_score = recommendation.as_ref().map(Recommendation::score);
        match &error {
            Some(reason) => warn!(
                target: "tune.engine",
                session = %self.session_id,
                rounds = state.rounds.len(),
                reason = %reason,
                "tuning session failed"
            ),
            None => info!(
                target: "tune.engine",
                session = %self.session_id,
                termination = termination.as_str(),
                rounds = state.rounds.len(),
                best_score = ?best_score,
                "tuning session finished"
            ),
        }

        TuneOutcome {
            session_id: self.session_id,
            mode: self.mode,
            termination,
            rounds: state.rounds,
            recommendation,
            pareto_front,
            error,
            started_at,
            ended_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{
        Combination, EvalResult, EvalSettings, EvaluatorError, ParamKind, ParamSpec, SampleStats,
        ACCEPTANCE_RATE,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Acceptance equals the value of `x`; applies beyond `fail_after` fail.
    struct LinearEvaluator {
        current: Mutex<f64>,
        applies: Mutex<usize>,
        fail_after: Option<usize>,
        source_missing: bool,
    }

    impl LinearEvaluator {
        fn new() -> Self {
            Self {
                current: Mutex::new(0.0),
                applies: Mutex::new(0),
                fail_after: None,
                source_missing: false,
            }
        }
    }

    #[async_trait]
    impl PipelineEvaluator for LinearEvaluator {
        async fn open_source(&self, source: &crate::sweep::DataSource) -> EvalResult<()> {
            if self.source_missing {
                return Err(EvaluatorError::SourceUnavailable(source.name.clone()));
            }
            Ok(())
        }

        async fn reset(&self) -> EvalResult<()> {
            Ok(())
        }

        async fn apply_params(&self, params: &Combination) -> EvalResult<()> {
            let mut applies = self.applies.lock().unwrap();
            *applies += 1;
            if self.fail_after.is_some_and(|limit| *applies > limit) {
                return Err(EvaluatorError::Apply("rejected".into()));
            }
            *self.current.lock().unwrap() = params.get("x").map(|v| v.as_f64()).unwrap_or(0.0);
            Ok(())
        }

        async fn sample_iteration(&self) -> EvalResult<SampleStats> {
            let value = *self.current.lock().unwrap();
            Ok([(ACCEPTANCE_RATE.to_string(), value)].into_iter().collect())
        }
    }

    fn request(max_rounds: usize) -> AutoTuneRequest {
        let space = ParameterSpace::new(vec![
            ParamSpec::range("x", ParamKind::Float, 0.0, 1.0, 0.05).unwrap(),
        ])
        .unwrap();
        let mut request = AutoTuneRequest::new(space);
        request.max_rounds = max_rounds;
        request.values_per_param = 5;
        request.top_k = 2;
        request.objective = ObjectiveKind::Acceptance;
        request.eval = EvalSettings {
            iterations: 1,
            settle_time: Duration::from_millis(10),
            sample_interval: Duration::ZERO,
        };
        request
    }

    #[tokio::test(start_paused = true)]
    async fn converges_when_best_score_stops_moving() {
        let tuner = AutoTuner::new(Arc::new(LinearEvaluator::new()), request(5));
        let reporter = tuner.reporter();
        let outcome = tuner.run().await;

        // the best value sits on the hard upper bound from round one on
        assert_eq!(outcome.termination, Termination::Converged);
        assert_eq!(outcome.rounds.len(), 2);
        let recommendation = outcome.recommendation.unwrap();
        assert_eq!(recommendation.score(), 1.0);
        assert_eq!(recommendation.round, 1);
        assert_eq!(reporter.phase(), TunerPhase::Completed(Termination::Converged));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_rounds() {
        let outcome = AutoTuner::new(Arc::new(LinearEvaluator::new()), request(1))
            .run()
            .await;
        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(outcome.rounds.len(), 1);
        assert_eq!(outcome.rounds[0].results.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_round_keeps_earlier_summaries() {
        let evaluator = LinearEvaluator {
            fail_after: Some(5),
            ..LinearEvaluator::new()
        };
        let outcome = AutoTuner::new(Arc::new(evaluator), request(3)).run().await;

        assert_eq!(outcome.termination, Termination::Failed);
        assert_eq!(outcome.rounds.len(), 1);
        assert!(outcome.error.unwrap().contains("round 2"));
        assert_eq!(outcome.recommendation.unwrap().round, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_source_fails_before_any_round() {
        let evaluator = LinearEvaluator {
            source_missing: true,
            ..LinearEvaluator::new()
        };
        let tuner = AutoTuner::new(Arc::new(evaluator), request(3));
        let reporter = tuner.reporter();
        let outcome = tuner.run().await;

        assert_eq!(outcome.termination, Termination::Failed);
        assert!(outcome.rounds.is_empty());
        assert!(outcome.recommendation.is_none());
        assert!(reporter.snapshot().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_reports_cancelled() {
        let tuner = AutoTuner::new(Arc::new(LinearEvaluator::new()), request(3));
        tuner.cancel_token().cancel();
        let outcome = tuner.run().await;
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert!(outcome.recommendation.is_none());
    }
}
