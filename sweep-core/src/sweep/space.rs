use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{SweepError, SweepResult};
use super::result::ComboResult;

/// Tolerance used when comparing sampled float values.
const VALUE_EPSILON: f64 = 1e-9;

/// Value type of a tunable parameter.
///
/// `Enum` parameters are categorical: their candidates are an explicit list
/// and narrowing keeps the subset seen in the top results instead of
/// computing a new range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Float,
    Int,
    Enum,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Float => "float64",
            ParamKind::Int => "int",
            ParamKind::Enum => "enum",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDomain {
    Range { start: f64, end: f64, step: f64 },
    Values(Vec<f64>),
}

/// A concrete value assigned to one parameter in a [`Combination`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(value) => *value as f64,
            ParamValue::Float(value) => *value,
        }
    }

    fn for_kind(kind: ParamKind, value: f64) -> Self {
        match kind {
            ParamKind::Int => ParamValue::Int(value.round() as i64),
            ParamKind::Float | ParamKind::Enum => ParamValue::Float(value),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Description of one tunable parameter and how to sample it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    name: String,
    kind: ParamKind,
    domain: ParamDomain,
}

impl ParamSpec {
    /// Bounds form: `values_per_param` evenly spaced samples over `[start, end]`.
    pub fn range(
        name: impl Into<String>,
        kind: ParamKind,
        start: f64,
        end: f64,
        step: f64,
    ) -> SweepResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SweepError::InvalidParam {
                name,
                reason: "parameter name must not be empty".to_string(),
            });
        }
        if kind == ParamKind::Enum {
            return Err(SweepError::InvalidParam {
                name,
                reason: "enum parameters require an explicit values list".to_string(),
            });
        }
        if !start.is_finite() || !end.is_finite() {
            return Err(SweepError::InvalidParam {
                name,
                reason: "start and end must be finite".to_string(),
            });
        }
        if end < start {
            return Err(SweepError::InvalidParam {
                name,
                reason: format!("end ({end}) must be >= start ({start})"),
            });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(SweepError::InvalidParam {
                name,
                reason: format!("step must be > 0, got {step}"),
            });
        }
        Ok(Self {
            name,
            kind,
            domain: ParamDomain::Range { start, end, step },
        })
    }

    /// Explicit-values form: candidates are used verbatim.
    pub fn values(name: impl Into<String>, kind: ParamKind, values: Vec<f64>) -> SweepResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SweepError::InvalidParam {
                name,
                reason: "parameter name must not be empty".to_string(),
            });
        }
        if values.is_empty() {
            return Err(SweepError::InvalidParam {
                name,
                reason: "explicit values list must not be empty".to_string(),
            });
        }
        if values.iter().any(|value| !value.is_finite()) {
            return Err(SweepError::InvalidParam {
                name,
                reason: "explicit values must be finite".to_string(),
            });
        }
        Ok(Self {
            name,
            kind,
            domain: ParamDomain::Values(values),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn domain(&self) -> &ParamDomain {
        &self.domain
    }

    /// Lowest and highest value this parameter can take.
    pub fn bounds(&self) -> (f64, f64) {
        match &self.domain {
            ParamDomain::Range { start, end, .. } => (*start, *end),
            ParamDomain::Values(values) => values.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), value| (lo.min(*value), hi.max(*value)),
            ),
        }
    }

    /// Candidate values for one sweep.
    ///
    /// The bounds form never produces more distinct values than its step grid
    /// holds, and always includes both endpoints when `end > start`. Int
    /// ranges sample whole numbers inside `[start, end]`.
    pub fn candidates(&self, values_per_param: usize) -> Vec<ParamValue> {
        match &self.domain {
            ParamDomain::Values(values) => values
                .iter()
                .map(|value| ParamValue::for_kind(self.kind, *value))
                .collect(),
            ParamDomain::Range { .. } => {
                let (lo, hi, count) = self.sample_plan(values_per_param);
                if count == 1 {
                    return vec![ParamValue::for_kind(self.kind, lo)];
                }
                let span = hi - lo;
                let mut samples = Vec::with_capacity(count);
                for idx in 0..count {
                    let offset = span * idx as f64 / (count - 1) as f64;
                    let value = match self.kind {
                        _ if idx == count - 1 => hi,
                        ParamKind::Int => lo + offset.round(),
                        ParamKind::Float | ParamKind::Enum => lo + offset,
                    };
                    let candidate = ParamValue::for_kind(self.kind, value);
                    if samples.last() != Some(&candidate) {
                        samples.push(candidate);
                    }
                }
                samples
            }
        }
    }

    /// Number of values [`ParamSpec::candidates`] yields, without building them.
    pub fn candidate_count(&self, values_per_param: usize) -> usize {
        match &self.domain {
            ParamDomain::Values(values) => values.len(),
            ParamDomain::Range { .. } => self.sample_plan(values_per_param).2,
        }
    }

    /// `(first, last, count)` of the evenly spaced samples of a bounds form.
    fn sample_plan(&self, values_per_param: usize) -> (f64, f64, usize) {
        let (start, end, step) = match &self.domain {
            ParamDomain::Range { start, end, step } => (*start, *end, *step),
            ParamDomain::Values(values) => {
                let (lo, hi) = self.bounds();
                return (lo, hi, values.len());
            }
        };
        if end - start <= VALUE_EPSILON {
            return (start, start, 1);
        }
        let count = grid_count(end - start, step, values_per_param);
        if self.kind != ParamKind::Int {
            return (start, end, count);
        }

        let lo = (start - VALUE_EPSILON).ceil();
        let hi = (end + VALUE_EPSILON).floor();
        if hi < lo {
            return (start, start, 1);
        }
        // at most one sample per whole number keeps rounded samples distinct
        let whole = hi - lo;
        let count = if whole + 1.0 < count as f64 {
            whole as usize + 1
        } else {
            count
        };
        (lo, hi, count)
    }

    fn narrowed(
        &self,
        observed: &[f64],
        values_per_param: usize,
        margin_steps: f64,
        hard: Option<&ParamSpec>,
    ) -> SweepResult<ParamSpec> {
        if observed.is_empty() {
            return Ok(self.clone());
        }

        if let ParamDomain::Values(values) = &self.domain {
            let kept: Vec<f64> = values
                .iter()
                .copied()
                .filter(|value| {
                    observed
                        .iter()
                        .any(|seen| (seen - value).abs() <= VALUE_EPSILON.max(value.abs() * 1e-12))
                        || (self.kind == ParamKind::Int
                            && observed.iter().any(|seen| *seen == value.round()))
                })
                .collect();
            let kept = if kept.is_empty() { observed.to_vec() } else { kept };
            return ParamSpec::values(self.name.clone(), self.kind, kept);
        }

        let min = observed.iter().copied().fold(f64::INFINITY, f64::min);
        let max = observed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if (max - min).abs() <= VALUE_EPSILON {
            return ParamSpec::values(self.name.clone(), self.kind, vec![min]);
        }

        let divisions = values_per_param.saturating_sub(1).max(1) as f64;
        let mut step = (max - min) / divisions;
        if self.kind == ParamKind::Int {
            step = step.max(1.0);
        }

        let mut lo = min - margin_steps * step;
        let mut hi = max + margin_steps * step;
        if let Some(hard) = hard {
            let (hard_lo, hard_hi) = hard.bounds();
            lo = lo.max(hard_lo);
            hi = hi.min(hard_hi);
        }
        if self.kind == ParamKind::Int {
            lo = lo.floor();
            hi = hi.ceil();
            if let Some(hard) = hard {
                let (hard_lo, hard_hi) = hard.bounds();
                lo = lo.max(hard_lo.ceil());
                hi = hi.min(hard_hi.floor());
            }
        }
        // the top-K values came from inside the hard bounds, keep them covered
        lo = lo.min(min);
        hi = hi.max(max);

        ParamSpec::range(self.name.clone(), self.kind, lo, hi, step)
    }
}

/// One concrete assignment of a value to every tunable parameter.
///
/// Keys are kept in name order so serialisation is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Combination(BTreeMap<String, ParamValue>);

impl Combination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, ParamValue> {
        &self.0
    }

    pub fn display(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl FromIterator<(String, ParamValue)> for Combination {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Ordered, name-unique set of parameter specs.
///
/// Immutable once built; narrowing produces a new space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    specs: Vec<ParamSpec>,
}

impl ParameterSpace {
    pub fn new(mut specs: Vec<ParamSpec>) -> SweepResult<Self> {
        if specs.is_empty() {
            return Err(SweepError::EmptySpace);
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = specs.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(SweepError::DuplicateParam(pair[0].name.clone()));
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    /// `{name: (min, max)}` for every parameter.
    pub fn bounds(&self) -> BTreeMap<String, (f64, f64)> {
        self.specs
            .iter()
            .map(|spec| (spec.name.clone(), spec.bounds()))
            .collect()
    }

    pub fn combination_count(&self, values_per_param: usize) -> SweepResult<usize> {
        check_values_per_param(values_per_param)?;
        Ok(self
            .specs
            .iter()
            .map(|spec| spec.candidate_count(values_per_param))
            .fold(1usize, usize::saturating_mul))
    }

    /// Like [`ParameterSpace::combination_count`], but fails with
    /// [`SweepError::TooManyCombinations`] as soon as the running product
    /// passes `limit`.
    pub fn combination_count_within(
        &self,
        values_per_param: usize,
        limit: usize,
    ) -> SweepResult<usize> {
        check_values_per_param(values_per_param)?;
        let mut count = 1usize;
        for spec in &self.specs {
            count = count
                .checked_mul(spec.candidate_count(values_per_param))
                .unwrap_or(usize::MAX);
            if count > limit {
                return Err(SweepError::TooManyCombinations { count, limit });
            }
        }
        Ok(count)
    }

    /// Cartesian product of every parameter's candidates.
    ///
    /// Parameters are walked in name order with the last name varying
    /// fastest, so identical inputs always yield the same sequence.
    pub fn enumerate(&self, values_per_param: usize) -> SweepResult<Vec<Combination>> {
        check_values_per_param(values_per_param)?;

        let axes: Vec<(&str, Vec<ParamValue>)> = self
            .specs
            .iter()
            .map(|spec| (spec.name.as_str(), spec.candidates(values_per_param)))
            .collect();
        let total = axes
            .iter()
            .map(|(_, values)| values.len())
            .fold(1usize, usize::saturating_mul);

        let mut combinations: Vec<Combination> = Vec::with_capacity(total);
        let mut cursor = vec![0usize; axes.len()];
        loop {
            combinations.push(
                axes.iter()
                    .zip(cursor.iter())
                    .map(|((name, values), idx)| (name.to_string(), values[*idx]))
                    .collect(),
            );

            let mut axis = axes.len();
            loop {
                if axis == 0 {
                    return Ok(combinations);
                }
                axis -= 1;
                cursor[axis] += 1;
                if cursor[axis] < axes[axis].1.len() {
                    break;
                }
                cursor[axis] = 0;
            }
        }
    }

    /// Shrinks every parameter around the values present in `top`.
    ///
    /// Each range becomes `[min - margin*step, max + margin*step]` with
    /// `step = (max - min) / (values_per_param - 1)`, clamped to `hard` when
    /// given. A parameter whose top values all coincide collapses to that
    /// single value. Results carrying an error are ignored.
    pub fn narrow(
        &self,
        top: &[ComboResult],
        values_per_param: usize,
        margin_steps: f64,
        hard: Option<&ParameterSpace>,
    ) -> SweepResult<ParameterSpace> {
        check_values_per_param(values_per_param)?;
        if !margin_steps.is_finite() || margin_steps < 0.0 {
            return Err(SweepError::InvalidRequest(format!(
                "margin_steps must be >= 0, got {margin_steps}"
            )));
        }
        let valid: Vec<&ComboResult> = top.iter().filter(|result| result.is_valid()).collect();
        if valid.is_empty() {
            return Err(SweepError::EmptySelection);
        }

        let specs = self
            .specs
            .iter()
            .map(|spec| {
                let observed: Vec<f64> = valid
                    .iter()
                    .filter_map(|result| result.combination.get(&spec.name))
                    .map(|value| value.as_f64())
                    .collect();
                let hard_spec = hard.and_then(|space| space.get(&spec.name));
                spec.narrowed(&observed, values_per_param, margin_steps, hard_spec)
            })
            .collect::<SweepResult<Vec<_>>>()?;

        ParameterSpace::new(specs)
    }
}

/// Samples in `[0, width]`: `values_per_param`, capped by the step grid, never
/// fewer than two.
fn grid_count(width: f64, step: f64, values_per_param: usize) -> usize {
    let grid = (width / step + VALUE_EPSILON).floor();
    let count = if grid + 1.0 >= values_per_param as f64 {
        values_per_param
    } else {
        (grid as usize).saturating_add(1)
    };
    count.max(2)
}

fn check_values_per_param(values_per_param: usize) -> SweepResult<()> {
    if values_per_param < 2 {
        return Err(SweepError::TooFewValues(values_per_param));
    }
    Ok(())
}
