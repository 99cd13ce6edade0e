use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tune::{
    AutoTuneRequest, Recommendation, RoundSummary, SessionMode, Termination, TuneOutcome,
};

/// One finished tuning session as stored in the history database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRunRecord {
    pub run_id: String,
    pub target: String,
    pub mode: SessionMode,
    pub termination: Termination,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub best_score: Option<f64>,
    pub request: AutoTuneRequest,
    pub recommendation: Option<Recommendation>,
    pub rounds: Vec<RoundSummary>,
    pub error: Option<String>,
}

impl SweepRunRecord {
    pub fn from_outcome(
        target: &str,
        request: &AutoTuneRequest,
        outcome: &TuneOutcome,
    ) -> Self {
        Self {
            run_id: outcome.session_id.to_string(),
            target: target.to_string(),
            mode: outcome.mode,
            termination: outcome.termination,
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            best_score: outcome.recommendation.as_ref().map(Recommendation::score),
            request: request.clone(),
            recommendation: outcome.recommendation.clone(),
            rounds: outcome.rounds.clone(),
            error: outcome.error.clone(),
        }
    }

    pub fn rounds_completed(&self) -> usize {
        self.rounds.len()
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let started_at: NaiveDateTime = row.get("started_at")?;
        let ended_at: NaiveDateTime = row.get("ended_at")?;
        let recommendation: Option<String> = row.get("recommendation_json")?;
        Ok(Self {
            run_id: row.get("run_id")?,
            target: row.get("target")?,
            mode: parse_column(row, "mode")?,
            termination: parse_column(row, "termination")?,
            started_at: Utc.from_utc_datetime(&started_at),
            ended_at: Utc.from_utc_datetime(&ended_at),
            best_score: row.get("best_score")?,
            request: decode_json(&row.get::<_, String>("request_json")?)?,
            recommendation: recommendation
                .as_deref()
                .map(decode_json::<Recommendation>)
                .transpose()?,
            rounds: decode_json(&row.get::<_, String>("rounds_json")?)?,
            error: row.get("error")?,
        })
    }
}

fn parse_column<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    row.get::<_, String>(column)?.parse().map_err(|reason: String| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, reason.into())
    })
}

fn decode_json<T: DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFilter {
    pub target: Option<String>,
    pub termination: Option<Termination>,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            target: None,
            termination: None,
            limit: 20,
        }
    }
}

/// Difference of one named value between two runs (`right - left`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDelta {
    pub name: String,
    pub left: Option<f64>,
    pub right: Option<f64>,
    pub delta: Option<f64>,
}

impl ValueDelta {
    fn new(name: &str, left: Option<f64>, right: Option<f64>) -> Self {
        let delta = match (left, right) {
            (Some(left), Some(right)) => Some(right - left),
            _ => None,
        };
        Self {
            name: name.to_string(),
            left,
            right,
            delta,
        }
    }
}

/// Side-by-side view of two runs' recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunComparison {
    pub left: String,
    pub right: String,
    pub score: ValueDelta,
    pub parameters: Vec<ValueDelta>,
    pub metrics: Vec<ValueDelta>,
}

impl RunComparison {
    pub fn between(left: &SweepRunRecord, right: &SweepRunRecord) -> Self {
        let left_rec = left.recommendation.as_ref();
        let right_rec = right.recommendation.as_ref();

        let params = |rec: Option<&Recommendation>| -> BTreeMap<String, f64> {
            rec.map(|rec| {
                rec.result
                    .combination
                    .iter()
                    .map(|(name, value)| (name.clone(), value.as_f64()))
                    .collect()
            })
            .unwrap_or_default()
        };
        let metrics = |rec: Option<&Recommendation>| -> BTreeMap<String, f64> {
            rec.map(|rec| rec.result.stats.means()).unwrap_or_default()
        };

        Self {
            left: left.run_id.clone(),
            right: right.run_id.clone(),
            score: ValueDelta::new("score", left.best_score, right.best_score),
            parameters: deltas(&params(left_rec), &params(right_rec)),
            metrics: deltas(&metrics(left_rec), &metrics(right_rec)),
        }
    }
}

fn deltas(left: &BTreeMap<String, f64>, right: &BTreeMap<String, f64>) -> Vec<ValueDelta> {
    let names: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    names
        .into_iter()
        .map(|name| ValueDelta::new(name, left.get(name).copied(), right.get(name).copied()))
        .collect()
}
