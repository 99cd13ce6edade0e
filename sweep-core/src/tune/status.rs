use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sweep::{ComboResult, ParameterSpace};

use super::objective::{ObjectiveKind, Weights};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    Exhausted,
    Cancelled,
    Failed,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Converged => "converged",
            Termination::Exhausted => "exhausted",
            Termination::Cancelled => "cancelled",
            Termination::Failed => "failed",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Termination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "converged" => Ok(Termination::Converged),
            "exhausted" => Ok(Termination::Exhausted),
            "cancelled" => Ok(Termination::Cancelled),
            "failed" => Ok(Termination::Failed),
            other => Err(format!("unknown termination: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Sweep,
    Auto,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Sweep => "sweep",
            SessionMode::Auto => "auto",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sweep" => Ok(SessionMode::Sweep),
            "auto" => Ok(SessionMode::Auto),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

/// Auto-tuner state machine position. Round numbers are 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunerPhase {
    #[default]
    Idle,
    RoundRunning(usize),
    RoundScoring(usize),
    Narrowing(usize),
    Completed(Termination),
}

impl TunerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunerPhase::Idle => "idle",
            TunerPhase::RoundRunning(_) => "round_running",
            TunerPhase::RoundScoring(_) => "round_scoring",
            TunerPhase::Narrowing(_) => "narrowing",
            TunerPhase::Completed(termination) => termination.as_str(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunerPhase::RoundRunning(_) | TunerPhase::RoundScoring(_) | TunerPhase::Narrowing(_)
        )
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            TunerPhase::Completed(termination) => Some(*termination),
            _ => None,
        }
    }
}

/// One completed round of an auto-tune session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: usize,
    pub space: ParameterSpace,
    pub results: Vec<ComboResult>,
    pub best: ComboResult,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RoundSummary {
    pub fn bounds(&self) -> BTreeMap<String, (f64, f64)> {
        self.space.bounds()
    }
}

/// Best result across every round of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub result: ComboResult,
    pub round: usize,
    pub objective: ObjectiveKind,
    pub weights: Weights,
}

impl Recommendation {
    pub fn score(&self) -> f64 {
        self.result.score
    }
}

/// Point-in-time copy of a session's progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub session_id: Option<Uuid>,
    pub mode: Option<SessionMode>,
    pub phase: TunerPhase,
    pub round: usize,
    pub total_rounds: usize,
    pub completed_combos: usize,
    pub total_combos: usize,
    pub rounds: Vec<RoundSummary>,
    /// Results of the round in flight, or of the last round once finished.
    pub results: Vec<ComboResult>,
    pub recommendation: Option<Recommendation>,
    pub pareto_front: Vec<ComboResult>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn termination(&self) -> Option<Termination> {
        self.phase.termination()
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_active()
    }
}

/// Shared, lock-protected status of one session.
///
/// Only the session's background task writes; any number of callers may
/// take snapshots concurrently. Every write is a single short critical
/// section, so readers never see a round half recorded.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, StatusSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, StatusSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_session(&self, session_id: Uuid, mode: SessionMode, total_rounds: usize) {
        *self.write() = StatusSnapshot {
            session_id: Some(session_id),
            mode: Some(mode),
            phase: TunerPhase::RoundRunning(1),
            round: 1,
            total_rounds,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
    }

    pub fn begin_round(&self, round: usize, total_combos: usize) {
        let mut status = self.write();
        status.phase = TunerPhase::RoundRunning(round);
        status.round = round;
        status.completed_combos = 0;
        status.total_combos = total_combos;
        status.results.clear();
    }

    /// Appends one result and bumps the completed counter together.
    pub fn record_combo(&self, result: ComboResult) {
        let mut status = self.write();
        status.results.push(result);
        status.completed_combos = status.results.len();
    }

    pub fn set_phase(&self, phase: TunerPhase) {
        self.write().phase = phase;
    }

    pub fn complete_round(&self, summary: RoundSummary) {
        let mut status = self.write();
        debug_assert!(status
            .rounds
            .last()
            .map_or(true, |last| last.round < summary.round));
        status.results = summary.results.clone();
        status.completed_combos = status.results.len();
        status.rounds.push(summary);
    }

    pub fn finish(
        &self,
        termination: Termination,
        recommendation: Option<Recommendation>,
        pareto_front: Vec<ComboResult>,
        error: Option<String>,
    ) {
        let mut status = self.write();
        status.phase = TunerPhase::Completed(termination);
        status.recommendation = recommendation;
        status.pareto_front = pareto_front;
        status.error = error;
        status.ended_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.read().clone()
    }

    pub fn phase(&self) -> TunerPhase {
        self.read().phase
    }
}
