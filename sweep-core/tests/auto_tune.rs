use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sweep_core::sweep::{ACCEPTANCE_RATE, MISALIGNMENT_RATIO};
use sweep_core::tune::{dominates, MetricDirection};
use sweep_core::{
    AutoTuneRequest, AutoTuner, CancelToken, Combination, EvalResult, EvalSettings, EvaluatorError,
    ObjectiveKind, ObjectiveScorer, ParamKind, ParamSpec, ParameterSpace, PipelineEvaluator,
    SampleStats, SweepRunner, Termination, TuneLimits,
};

/// Acceptance peaks at noise_relative 0.03 and closeness_multiplier 8;
/// misalignment grows with noise_relative.
struct Surface {
    current: Mutex<Option<Combination>>,
    applied: Arc<Mutex<Vec<Combination>>>,
    cancel_after: Option<(usize, CancelToken)>,
    source_lost_after: Option<usize>,
}

impl Surface {
    fn new() -> Self {
        Self {
            current: Mutex::new(None),
            applied: Arc::new(Mutex::new(Vec::new())),
            cancel_after: None,
            source_lost_after: None,
        }
    }

    fn losing_source_after(applies: usize) -> Self {
        Self {
            source_lost_after: Some(applies),
            ..Self::new()
        }
    }

    fn cancelling_after(applies: usize, token: CancelToken) -> Self {
        Self {
            cancel_after: Some((applies, token)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl PipelineEvaluator for Surface {
    async fn reset(&self) -> EvalResult<()> {
        Ok(())
    }

    async fn apply_params(&self, params: &Combination) -> EvalResult<()> {
        let mut applied = self.applied.lock().unwrap();
        applied.push(params.clone());
        if let Some((limit, token)) = &self.cancel_after {
            if applied.len() == *limit {
                token.cancel();
            }
        }
        *self.current.lock().unwrap() = Some(params.clone());
        Ok(())
    }

    async fn sample_iteration(&self) -> EvalResult<SampleStats> {
        let applies = self.applied.lock().unwrap().len();
        if self.source_lost_after.is_some_and(|limit| applies > limit) {
            return Err(EvaluatorError::SourceUnavailable("bench.pcap".into()));
        }
        let current = self.current.lock().unwrap().clone();
        let params = current.ok_or_else(|| EvaluatorError::Sample("no params".into()))?;
        let noise = params.get("noise_relative").unwrap().as_f64();
        let closeness = params.get("closeness_multiplier").unwrap().as_f64();
        let acceptance = 1.0 - 10.0 * (noise - 0.03).abs() - 0.001 * (closeness - 8.0).abs();
        Ok([
            (ACCEPTANCE_RATE.to_string(), acceptance),
            (MISALIGNMENT_RATIO.to_string(), noise),
        ]
        .into_iter()
        .collect())
    }
}

fn space() -> ParameterSpace {
    ParameterSpace::new(vec![
        ParamSpec::range("noise_relative", ParamKind::Float, 0.01, 0.1, 0.01).unwrap(),
        ParamSpec::range("closeness_multiplier", ParamKind::Float, 2.0, 16.0, 1.0).unwrap(),
    ])
    .unwrap()
}

fn request(max_rounds: usize) -> AutoTuneRequest {
    let mut request = AutoTuneRequest::new(space());
    request.max_rounds = max_rounds;
    request.values_per_param = 5;
    request.top_k = 5;
    request.objective = ObjectiveKind::Acceptance;
    request.eval = EvalSettings {
        iterations: 2,
        settle_time: Duration::from_secs(1),
        sample_interval: Duration::from_millis(50),
    };
    request
}

#[tokio::test(start_paused = true)]
async fn second_round_narrows_around_the_top_results() {
    let outcome = AutoTuner::new(Arc::new(Surface::new()), request(3)).run().await;

    assert!(outcome.rounds.len() >= 2);
    let first = &outcome.rounds[0];
    assert_eq!(first.results.len(), 25);
    let bounds = first.bounds();
    assert_eq!(bounds["noise_relative"], (0.01, 0.1));
    assert_eq!(bounds["closeness_multiplier"], (2.0, 16.0));

    let scorer = ObjectiveScorer::new(ObjectiveKind::Acceptance, Default::default());
    let top = scorer.top_k(&first.results, 5);
    for result in &top {
        let noise = result.combination.get("noise_relative").unwrap().as_f64();
        assert!((0.02..=0.04).contains(&noise), "top value {noise} outside [0.02, 0.04]");
    }

    let narrowed = outcome.rounds[1].bounds();
    let (lo, hi) = narrowed["noise_relative"];
    assert!(lo >= 0.015 - 1e-9 && hi <= 0.045 + 1e-9, "noise bounds [{lo}, {hi}]");
    for result in &top {
        for (name, value) in result.combination.iter() {
            let (lo, hi) = narrowed[name.as_str()];
            let value = value.as_f64();
            assert!(
                lo - 1e-9 <= value && value <= hi + 1e-9,
                "{name}={value} outside [{lo}, {hi}]"
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn recommendation_is_at_least_every_round_best() {
    let mut request = request(3);
    request.convergence_threshold = 0.0;
    let outcome = AutoTuner::new(Arc::new(Surface::new()), request).run().await;

    assert_eq!(outcome.termination, Termination::Exhausted);
    assert_eq!(outcome.rounds.len(), 3);
    let recommendation = outcome.recommendation.expect("recommendation");
    for round in &outcome.rounds {
        assert!(recommendation.score() >= round.best.score);
    }
    let best_round = outcome
        .rounds
        .iter()
        .find(|round| round.best.score == recommendation.score())
        .expect("recommendation comes from a round");
    assert_eq!(recommendation.round, best_round.round);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_round_keeps_best_effort_recommendation() {
    let cancel = CancelToken::new();
    let evaluator = Surface::cancelling_after(27, cancel.clone());
    let applied = evaluator.applied.clone();
    let outcome = AutoTuner::new(Arc::new(evaluator), request(3))
        .with_cancel(cancel)
        .run()
        .await;

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(applied.lock().unwrap().len(), 27);
    let recommendation = outcome.recommendation.expect("partial recommendation");
    assert!(recommendation.score() >= outcome.rounds[0].best.score);
}

#[tokio::test(start_paused = true)]
async fn single_round_matches_a_direct_sweep() {
    let request = request(1);
    let outcome = AutoTuner::new(Arc::new(Surface::new()), request.clone())
        .run()
        .await;
    assert_eq!(outcome.termination, Termination::Exhausted);
    assert_eq!(outcome.rounds.len(), 1);

    let runner = SweepRunner::new(Arc::new(Surface::new()), request.eval.clone());
    let direct = runner
        .start(&request.space, request.values_per_param)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(direct.is_complete());
    let scorer = ObjectiveScorer::new(request.objective, request.weights.clone());
    let direct = scorer.score_results(direct.results);

    assert_eq!(outcome.rounds[0].results, direct);
    assert_eq!(
        outcome.recommendation.unwrap().result,
        scorer.best(&direct).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn pareto_front_spans_every_round() {
    let mut request = request(2);
    request.objective = ObjectiveKind::Pareto;
    request.convergence_threshold = 0.0;
    let tuner = AutoTuner::new(Arc::new(Surface::new()), request.clone());
    let reporter = tuner.reporter();
    let outcome = tuner.run().await;

    assert_eq!(outcome.termination, Termination::Exhausted);
    assert_eq!(outcome.rounds.len(), 2);
    assert!(!outcome.pareto_front.is_empty());
    assert_eq!(reporter.snapshot().pareto_front, outcome.pareto_front);

    let directions = [MetricDirection::Maximize, MetricDirection::Minimize];
    let objectives = |stats: &sweep_core::ComboStats| {
        vec![
            stats.mean(ACCEPTANCE_RATE).unwrap(),
            stats.mean(MISALIGNMENT_RATIO).unwrap(),
        ]
    };
    let everything: Vec<_> = outcome
        .rounds
        .iter()
        .flat_map(|round| round.results.iter())
        .collect();
    for member in &outcome.pareto_front {
        let values = objectives(&member.stats);
        for other in &everything {
            assert!(
                !dominates(&objectives(&other.stats), &values, &directions),
                "{} is dominated by {}",
                member.combination.display(),
                other.combination.display()
            );
        }
    }

    // narrowing follows the pareto selection of round one
    let scorer = ObjectiveScorer::new(ObjectiveKind::Pareto, request.weights.clone());
    let first = &outcome.rounds[0].results;
    let top = scorer.top_k(first, request.top_k);
    for member in scorer.pareto_front(first) {
        assert!(top.contains(&member));
    }
    let narrowed = outcome.rounds[1].bounds();
    for result in &top {
        for (name, value) in result.combination.iter() {
            let (lo, hi) = narrowed[name.as_str()];
            let value = value.as_f64();
            assert!(lo - 1e-9 <= value && value <= hi + 1e-9);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn source_lost_mid_round_fails_and_keeps_earlier_rounds() {
    let evaluator = Surface::losing_source_after(27);
    let applied = evaluator.applied.clone();
    let tuner = AutoTuner::new(Arc::new(evaluator), request(3));
    let reporter = tuner.reporter();
    let outcome = tuner.run().await;

    assert_eq!(outcome.termination, Termination::Failed);
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(outcome.rounds[0].results.len(), 25);
    assert_eq!(applied.lock().unwrap().len(), 28);
    let error = outcome.error.expect("failure reason");
    assert!(error.contains("bench.pcap"), "{error}");

    let recommendation = outcome.recommendation.expect("recommendation from round one");
    assert!(recommendation.score() >= outcome.rounds[0].best.score);
    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.rounds.len(), 1);
    assert_eq!(snapshot.error.as_deref(), Some(error.as_str()));
}

#[tokio::test(start_paused = true)]
async fn narrowed_space_over_the_limit_fails_before_running() {
    let space = ParameterSpace::new(vec![
        ParamSpec::range("noise_relative", ParamKind::Float, 0.02, 0.04, 0.01).unwrap(),
        ParamSpec::range("closeness_multiplier", ParamKind::Float, 7.0, 9.0, 1.0).unwrap(),
    ])
    .unwrap();
    let mut request = request(3);
    request.space = space;
    let limits = TuneLimits {
        max_combinations: 10,
        ..Default::default()
    };
    request.validate(&limits).unwrap();

    let evaluator = Surface::new();
    let applied = evaluator.applied.clone();
    let outcome = AutoTuner::new(Arc::new(evaluator), request)
        .with_limits(limits)
        .run()
        .await;

    assert_eq!(outcome.termination, Termination::Failed);
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(applied.lock().unwrap().len(), 9);
    let error = outcome.error.expect("failure reason");
    assert!(error.contains("round 2") && error.contains("limit is 10"), "{error}");
    assert_eq!(outcome.recommendation.unwrap().round, 1);
}
