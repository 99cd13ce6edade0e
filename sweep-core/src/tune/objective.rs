use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sweep::{
    ComboResult, ComboStats, ACCEPTANCE_RATE, ACTIVE_TRACKS, ALIGNMENT_DEG, MISALIGNMENT_RATIO,
    NONZERO_CELLS,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveKind {
    /// Acceptance rate alone.
    Acceptance,
    #[default]
    Weighted,
    /// Weighted score for ranking plus a non-dominated front over the
    /// weighted metrics.
    Pareto,
}

impl ObjectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveKind::Acceptance => "acceptance",
            ObjectiveKind::Weighted => "weighted",
            ObjectiveKind::Pareto => "pareto",
        }
    }
}

impl fmt::Display for ObjectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectiveKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "acceptance" => Ok(ObjectiveKind::Acceptance),
            "weighted" | "" => Ok(ObjectiveKind::Weighted),
            "pareto" => Ok(ObjectiveKind::Pareto),
            other => Err(format!(
                "unknown objective {other:?}, expected acceptance, weighted or pareto"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricDirection {
    Maximize,
    Minimize,
}

impl MetricDirection {
    pub fn sign(&self) -> f64 {
        match self {
            MetricDirection::Maximize => 1.0,
            MetricDirection::Minimize => -1.0,
        }
    }
}

/// Whether a higher value of `metric` is better. Unknown metrics are
/// maximised.
pub fn metric_direction(metric: &str) -> MetricDirection {
    match metric {
        MISALIGNMENT_RATIO | ALIGNMENT_DEG | NONZERO_CELLS => MetricDirection::Minimize,
        ACCEPTANCE_RATE | ACTIVE_TRACKS => MetricDirection::Maximize,
        _ => MetricDirection::Maximize,
    }
}

/// Short names accepted in weight tables.
fn canonical_metric(name: &str) -> &str {
    match name {
        "acceptance" => ACCEPTANCE_RATE,
        "misalignment" => MISALIGNMENT_RATIO,
        "alignment" => ALIGNMENT_DEG,
        "tracks" => ACTIVE_TRACKS,
        "cells" => NONZERO_CELLS,
        other => other,
    }
}

/// Open `metric -> weight` table. Weights are magnitudes; the metric's
/// direction supplies the sign, so a negative weight inverts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct Weights(BTreeMap<String, f64>);

impl From<BTreeMap<String, f64>> for Weights {
    fn from(entries: BTreeMap<String, f64>) -> Self {
        Self::new(entries)
    }
}

impl From<Weights> for BTreeMap<String, f64> {
    fn from(weights: Weights) -> Self {
        weights.0
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self::new([
            (ACCEPTANCE_RATE.to_string(), 1.0),
            (MISALIGNMENT_RATIO.to_string(), 0.5),
        ])
    }
}

impl Weights {
    pub fn new(entries: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(name, weight)| (canonical_metric(&name).to_string(), weight))
                .collect(),
        )
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(canonical_metric(metric)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, weight)| (name.as_str(), *weight))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of `self` with `overrides` replacing matching entries.
    pub fn merged(&self, overrides: &BTreeMap<String, f64>) -> Self {
        let mut merged = self.0.clone();
        for (name, weight) in overrides {
            merged.insert(canonical_metric(name).to_string(), *weight);
        }
        Self(merged)
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

/// Turns per-combination statistics into scores and rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveScorer {
    kind: ObjectiveKind,
    weights: Weights,
}

impl ObjectiveScorer {
    pub fn new(kind: ObjectiveKind, weights: Weights) -> Self {
        Self { kind, weights }
    }

    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// `Σ sign(metric) * weight * mean(metric)`; missing metrics count as zero.
    pub fn score(&self, stats: &ComboStats) -> f64 {
        match self.kind {
            ObjectiveKind::Acceptance => stats.acceptance_rate(),
            ObjectiveKind::Weighted | ObjectiveKind::Pareto => self
                .weights
                .iter()
                .map(|(metric, weight)| {
                    metric_direction(metric).sign() * weight * stats.mean(metric).unwrap_or(0.0)
                })
                .sum(),
        }
    }

    /// Scores valid results; failed results keep a zero score.
    pub fn score_result(&self, result: ComboResult) -> ComboResult {
        if result.is_valid() {
            let score = self.score(&result.stats);
            result.with_score(score)
        } else {
            result.with_score(0.0)
        }
    }

    pub fn score_results(&self, results: Vec<ComboResult>) -> Vec<ComboResult> {
        results
            .into_iter()
            .map(|result| self.score_result(result))
            .collect()
    }

    /// Valid results by score descending; equal scores keep enumeration order.
    pub fn rank(&self, results: &[ComboResult]) -> Vec<ComboResult> {
        let mut ranked: Vec<ComboResult> = results
            .iter()
            .filter(|result| result.is_valid())
            .cloned()
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        ranked
    }

    pub fn best(&self, results: &[ComboResult]) -> Option<ComboResult> {
        self.rank(results).into_iter().next()
    }

    /// Non-dominated valid results, in rank order.
    pub fn pareto_front(&self, results: &[ComboResult]) -> Vec<ComboResult> {
        let ranked = self.rank(results);
        let (objectives, directions) = self.objectives(&ranked);
        ranked
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                !objectives
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != *i && dominates(other, &objectives[*i], &directions))
            })
            .map(|(_, result)| result.clone())
            .collect()
    }

    /// The `k` results to narrow around. In pareto mode front members come
    /// first, then the remaining results by score.
    pub fn top_k(&self, results: &[ComboResult], k: usize) -> Vec<ComboResult> {
        let ranked = self.rank(results);
        if k >= ranked.len() {
            return ranked;
        }
        match self.kind {
            ObjectiveKind::Acceptance | ObjectiveKind::Weighted => {
                ranked.into_iter().take(k).collect()
            }
            ObjectiveKind::Pareto => {
                let front = self.pareto_front(&ranked);
                let mut selected: Vec<ComboResult> = front.into_iter().take(k).collect();
                for result in ranked {
                    if selected.len() >= k {
                        break;
                    }
                    if !selected.iter().any(|chosen| chosen == &result) {
                        selected.push(result);
                    }
                }
                selected
            }
        }
    }

    fn objectives(&self, results: &[ComboResult]) -> (Vec<Vec<f64>>, Vec<MetricDirection>) {
        let metrics: Vec<(&str, MetricDirection)> = match self.kind {
            ObjectiveKind::Acceptance => vec![(ACCEPTANCE_RATE, MetricDirection::Maximize)],
            ObjectiveKind::Weighted | ObjectiveKind::Pareto => self
                .weights
                .iter()
                .filter(|(_, weight)| *weight != 0.0)
                .map(|(metric, weight)| {
                    let natural = metric_direction(metric);
                    let direction = if weight < 0.0 {
                        match natural {
                            MetricDirection::Maximize => MetricDirection::Minimize,
                            MetricDirection::Minimize => MetricDirection::Maximize,
                        }
                    } else {
                        natural
                    };
                    (metric, direction)
                })
                .collect(),
        };
        let values = results
            .iter()
            .map(|result| {
                metrics
                    .iter()
                    .map(|(metric, _)| result.stats.mean(metric).unwrap_or(0.0))
                    .collect()
            })
            .collect();
        let directions = metrics.into_iter().map(|(_, direction)| direction).collect();
        (values, directions)
    }
}

/// `a` dominates `b` when it is no worse on every objective and strictly
/// better on at least one.
pub fn dominates(a: &[f64], b: &[f64], directions: &[MetricDirection]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), directions.len());

    let mut strictly_better = false;
    for ((&av, &bv), direction) in a.iter().zip(b.iter()).zip(directions.iter()) {
        let (better, worse) = match direction {
            MetricDirection::Maximize => (av > bv, av < bv),
            MetricDirection::Minimize => (av < bv, av > bv),
        };
        if worse {
            return false;
        }
        if better {
            strictly_better = true;
        }
    }
    strictly_better
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{Combination, ParamValue, SampleStats};

    fn result(index: usize, acceptance: f64, misalignment: f64) -> ComboResult {
        let sample: SampleStats = [
            (ACCEPTANCE_RATE.to_string(), acceptance),
            (MISALIGNMENT_RATIO.to_string(), misalignment),
        ]
        .into_iter()
        .collect();
        let combination = Combination::new().with("a", ParamValue::Int(index as i64));
        ComboResult::new(index, combination, ComboStats::from_samples(&[sample]))
    }

    #[test]
    fn weighted_score_uses_metric_direction() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Weighted, Weights::default());
        let scored = scorer.score_result(result(0, 0.8, 0.2));
        assert!((scored.score - (0.8 - 0.5 * 0.2)).abs() < 1e-12);
    }

    #[test]
    fn acceptance_objective_ignores_weights() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Acceptance, Weights::default());
        assert_eq!(scorer.score_result(result(0, 0.7, 0.9)).score, 0.7);
    }

    #[test]
    fn flipping_weight_sign_reverses_ranking() {
        let candidates = vec![result(0, 0.5, 0.1), result(1, 0.5, 0.3)];
        let positive = ObjectiveScorer::new(
            ObjectiveKind::Weighted,
            Weights::new([(MISALIGNMENT_RATIO.to_string(), 1.0)]),
        );
        let negative = ObjectiveScorer::new(
            ObjectiveKind::Weighted,
            Weights::new([(MISALIGNMENT_RATIO.to_string(), -1.0)]),
        );
        let best_positive = positive.best(&positive.score_results(candidates.clone())).unwrap();
        let best_negative = negative.best(&negative.score_results(candidates)).unwrap();
        assert_eq!(best_positive.index, 0);
        assert_eq!(best_negative.index, 1);
    }

    #[test]
    fn rank_breaks_ties_by_enumeration_order_and_skips_failures() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Acceptance, Weights::default());
        let results = scorer.score_results(vec![
            result(0, 0.4, 0.0),
            result(1, 0.9, 0.0).with_error("apply failed"),
            result(2, 0.6, 0.0),
            result(3, 0.6, 0.0),
        ]);
        let order: Vec<usize> = scorer.rank(&results).iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 3, 0]);
    }

    #[test]
    fn short_weight_names_are_accepted() {
        let weights = Weights::new([("acceptance".to_string(), 2.0)]);
        assert_eq!(weights.get(ACCEPTANCE_RATE), Some(2.0));
        let merged = Weights::default().merged(&[("misalignment".to_string(), 0.0)].into());
        assert_eq!(merged.get(MISALIGNMENT_RATIO), Some(0.0));
    }

    #[test]
    fn pareto_front_contains_only_non_dominated() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Pareto, Weights::default());
        let results = scorer.score_results(vec![
            result(0, 0.9, 0.4),
            result(1, 0.7, 0.1),
            result(2, 0.6, 0.3),
            result(3, 0.9, 0.5),
        ]);
        let front: Vec<usize> = scorer.pareto_front(&results).iter().map(|r| r.index).collect();
        assert_eq!(front.len(), 2);
        assert!(front.contains(&0));
        assert!(front.contains(&1));

        let top: Vec<usize> = scorer.top_k(&results, 3).iter().map(|r| r.index).collect();
        assert_eq!(top.len(), 3);
        assert!(top[..2].contains(&0) && top[..2].contains(&1));
    }

    #[test]
    fn pareto_front_of_single_result_is_itself() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Pareto, Weights::default());
        let results = scorer.score_results(vec![result(0, 0.1, 0.9)]);
        assert_eq!(scorer.pareto_front(&results).len(), 1);
    }

    #[test]
    fn top_k_returns_everything_when_k_is_large() {
        let scorer = ObjectiveScorer::new(ObjectiveKind::Weighted, Weights::default());
        let results = scorer.score_results(vec![result(0, 0.1, 0.0), result(1, 0.2, 0.0)]);
        assert_eq!(scorer.top_k(&results, 10).len(), 2);
        assert_eq!(scorer.top_k(&results, 1)[0].index, 1);
    }

    #[test]
    fn objective_kind_parses_case_insensitively() {
        assert_eq!("Pareto".parse::<ObjectiveKind>(), Ok(ObjectiveKind::Pareto));
        assert!("bayes".parse::<ObjectiveKind>().is_err());
    }
}
