use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::sweep::{ComboResult, ParamValue};
use crate::tune::{
    Recommendation, RoundSummary, SessionMode, StatusSnapshot, Termination, TunerPhase,
};

/// Body of `GET /sweep/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub mode: Option<SessionMode>,
    pub round: usize,
    pub total_rounds: usize,
    pub completed_combos: usize,
    pub total_combos: usize,
    pub round_results: Vec<RoundResult>,
    pub results: Vec<ComboView>,
    /// Null until the session reaches a terminal state.
    pub recommendation: Option<Map<String, Value>>,
    pub session_id: Option<Uuid>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pareto_front: Vec<ComboView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&StatusSnapshot> for StatusResponse {
    fn from(snapshot: &StatusSnapshot) -> Self {
        Self {
            status: coarse_status(snapshot.phase).to_string(),
            mode: snapshot.mode,
            round: snapshot.round,
            total_rounds: snapshot.total_rounds,
            completed_combos: snapshot.completed_combos,
            total_combos: snapshot.total_combos,
            round_results: snapshot.rounds.iter().map(RoundResult::from).collect(),
            results: snapshot.results.iter().map(ComboView::from).collect(),
            recommendation: snapshot
                .termination()
                .and(snapshot.recommendation.as_ref())
                .map(flatten_recommendation),
            session_id: snapshot.session_id,
            state: snapshot.phase.as_str().to_string(),
            error: snapshot.error.clone(),
            pareto_front: snapshot.pareto_front.iter().map(ComboView::from).collect(),
            started_at: snapshot.started_at,
            ended_at: snapshot.ended_at,
        }
    }
}

fn coarse_status(phase: TunerPhase) -> &'static str {
    match phase {
        TunerPhase::Idle => "idle",
        TunerPhase::RoundRunning(_) | TunerPhase::RoundScoring(_) | TunerPhase::Narrowing(_) => {
            "running"
        }
        TunerPhase::Completed(Termination::Converged | Termination::Exhausted) => "complete",
        TunerPhase::Completed(Termination::Failed) => "failed",
        TunerPhase::Completed(Termination::Cancelled) => "cancelled",
    }
}

/// Parameter values, `score` and metric means in one flat object.
pub fn flatten_recommendation(recommendation: &Recommendation) -> Map<String, Value> {
    let result = &recommendation.result;
    let mut fields = Map::new();
    for (name, value) in result.combination.iter() {
        fields.insert(name.clone(), param_json(*value));
    }
    fields.insert("score".to_string(), Value::from(result.score));
    for (metric, mean) in result.stats.means() {
        fields.insert(metric, Value::from(mean));
    }
    fields
}

fn param_json(value: ParamValue) -> Value {
    match value {
        ParamValue::Int(value) => Value::from(value),
        ParamValue::Float(value) => Value::from(value),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round: usize,
    pub bounds: BTreeMap<String, [f64; 2]>,
    pub best_score: f64,
    pub best_params: BTreeMap<String, ParamValue>,
}

impl From<&RoundSummary> for RoundResult {
    fn from(summary: &RoundSummary) -> Self {
        Self {
            round: summary.round,
            bounds: summary
                .bounds()
                .into_iter()
                .map(|(name, (min, max))| (name, [min, max]))
                .collect(),
            best_score: summary.best.score,
            best_params: summary.best.combination.as_map().clone(),
        }
    }
}

/// Wire form of one evaluated combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboView {
    pub index: usize,
    pub params: BTreeMap<String, ParamValue>,
    pub score: f64,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ComboResult> for ComboView {
    fn from(result: &ComboResult) -> Self {
        Self {
            index: result.index,
            params: result.combination.as_map().clone(),
            score: result.score,
            metrics: result.stats.means(),
            error: result.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{Combination, ComboStats, SampleStats, ACCEPTANCE_RATE};
    use crate::tune::{ObjectiveKind, Weights};

    fn recommendation() -> Recommendation {
        let sample: SampleStats = [(ACCEPTANCE_RATE.to_string(), 0.75)].into_iter().collect();
        let result = ComboResult::new(
            3,
            Combination::new()
                .with("noise_relative", ParamValue::Float(0.03))
                .with("min_cluster_points", ParamValue::Int(5)),
            ComboStats::from_samples(&[sample]),
        )
        .with_score(0.75);
        Recommendation {
            result,
            round: 2,
            objective: ObjectiveKind::Weighted,
            weights: Weights::default(),
        }
    }

    #[test]
    fn idle_snapshot_renders_idle() {
        let response = StatusResponse::from(&StatusSnapshot::default());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["state"], "idle");
        assert!(json["recommendation"].is_null());
        assert!(json["mode"].is_null());
        assert!(json.get("pareto_front").is_none());
    }

    #[test]
    fn recommendation_is_hidden_until_terminal() {
        let mut snapshot = StatusSnapshot {
            phase: TunerPhase::Narrowing(1),
            recommendation: Some(recommendation()),
            ..Default::default()
        };
        let running = StatusResponse::from(&snapshot);
        assert_eq!(running.status, "running");
        assert!(running.recommendation.is_none());

        snapshot.phase = TunerPhase::Completed(Termination::Exhausted);
        let done = StatusResponse::from(&snapshot);
        assert_eq!(done.status, "complete");
        assert_eq!(done.state, "exhausted");
        let flat = done.recommendation.unwrap();
        assert_eq!(flat["noise_relative"], 0.03);
        assert_eq!(flat["min_cluster_points"], 5);
        assert_eq!(flat["score"], 0.75);
        assert_eq!(flat[ACCEPTANCE_RATE], 0.75);
    }

    #[test]
    fn terminal_states_map_to_coarse_status() {
        assert_eq!(coarse_status(TunerPhase::RoundRunning(2)), "running");
        assert_eq!(coarse_status(TunerPhase::Completed(Termination::Converged)), "complete");
        assert_eq!(coarse_status(TunerPhase::Completed(Termination::Failed)), "failed");
        assert_eq!(coarse_status(TunerPhase::Completed(Termination::Cancelled)), "cancelled");
    }
}
