use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::TunerConfig;
use crate::duration::parse_duration;
use crate::sweep::{
    DataSource, ParamKind, ParamSpec, ParameterSpace, ACCEPTANCE_RATE, ACTIVE_TRACKS,
    ALIGNMENT_DEG, MISALIGNMENT_RATIO, NONZERO_CELLS,
};
use crate::tune::{AutoTuneRequest, ObjectiveKind};

use super::error::{ApiError, ApiResult};

/// Names that would collide with the flattened recommendation object.
const RESERVED_NAMES: [&str; 6] = [
    "score",
    ACCEPTANCE_RATE,
    NONZERO_CELLS,
    ACTIVE_TRACKS,
    ALIGNMENT_DEG,
    MISALIGNMENT_RATIO,
];

/// One entry of the `params` list: either bounds or an explicit `values` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamRequest {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
}

impl ParamRequest {
    pub fn into_spec(self) -> ApiResult<ParamSpec> {
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(ApiError::Invalid(format!(
                "parameter name {:?} is reserved",
                self.name
            )));
        }
        let kind = parse_kind(self.kind.as_deref())?;
        if let Some(values) = self.values {
            if self.start.is_some() || self.end.is_some() || self.step.is_some() {
                return Err(ApiError::Invalid(format!(
                    "parameter {}: use either values or start/end/step, not both",
                    self.name
                )));
            }
            return Ok(ParamSpec::values(self.name, kind, values)?);
        }
        match (self.start, self.end, self.step) {
            (Some(start), Some(end), Some(step)) => {
                Ok(ParamSpec::range(self.name, kind, start, end, step)?)
            }
            _ => Err(ApiError::Invalid(format!(
                "parameter {}: start, end and step are required without values",
                self.name
            ))),
        }
    }
}

fn parse_kind(raw: Option<&str>) -> ApiResult<ParamKind> {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("float64") | Some("float") | Some("float32") => Ok(ParamKind::Float),
        Some("int") | Some("int64") | Some("integer") => Ok(ParamKind::Int),
        Some("enum") => Ok(ParamKind::Enum),
        Some(other) => Err(ApiError::Invalid(format!("unknown parameter type {other:?}"))),
    }
}

/// Body of `POST /sweep/auto` and `POST /sweep/start`.
///
/// Every field except `params` is optional and falls back to the tuner
/// configuration. Integer fields are signed so negative input is reported
/// as a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSweepRequest {
    pub params: Vec<ParamRequest>,
    pub max_rounds: Option<i64>,
    pub values_per_param: Option<i64>,
    pub top_k: Option<i64>,
    pub objective: Option<String>,
    pub weights: Option<BTreeMap<String, f64>>,
    pub iterations: Option<i64>,
    pub settle_time: Option<String>,
    pub interval: Option<String>,
    pub seed: Option<bool>,
    pub data_source: Option<String>,
    pub convergence_threshold: Option<f64>,
    pub margin_steps: Option<f64>,
}

impl AutoSweepRequest {
    pub fn into_request(self, config: &TunerConfig) -> ApiResult<AutoTuneRequest> {
        let specs = self
            .params
            .into_iter()
            .map(ParamRequest::into_spec)
            .collect::<ApiResult<Vec<_>>>()?;
        let mut request = config.base_request(ParameterSpace::new(specs)?);

        if let Some(value) = self.max_rounds {
            request.max_rounds = non_negative("max_rounds", value)?;
        }
        if let Some(value) = self.values_per_param {
            request.values_per_param = non_negative("values_per_param", value)?;
        }
        if let Some(value) = self.top_k {
            request.top_k = non_negative("top_k", value)?;
        }
        if let Some(objective) = self.objective {
            request.objective = objective.parse::<ObjectiveKind>().map_err(ApiError::Invalid)?;
        }
        if let Some(weights) = self.weights {
            request.weights = request.weights.merged(&weights);
        }
        if let Some(value) = self.iterations {
            request.eval.iterations = non_negative("iterations", value)?;
        }
        if let Some(raw) = self.settle_time {
            request.eval.settle_time = parse_duration(&raw)?;
        }
        if let Some(raw) = self.interval {
            request.eval.sample_interval = parse_duration(&raw)?;
        }
        if let Some(value) = self.convergence_threshold {
            request.convergence_threshold = value;
        }
        if let Some(value) = self.margin_steps {
            request.margin_steps = value;
        }
        request.data_source = DataSource::new(
            self.data_source.unwrap_or_default(),
            self.seed.unwrap_or(false),
        );
        Ok(request)
    }
}

fn non_negative(field: &str, value: i64) -> ApiResult<usize> {
    usize::try_from(value)
        .map_err(|_| ApiError::Invalid(format!("{field} must not be negative, got {value}")))
}
