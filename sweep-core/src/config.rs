use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::duration::serde_duration;
use crate::error::{ConfigError, Result};
use crate::history::{HistoryResult, SqliteSweepStore};
use crate::sweep::{EvalSettings, ParameterSpace, SyntheticConfig};
use crate::tune::{AutoTuneRequest, ObjectiveKind, TuneLimits, Weights};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TunerConfig {
    pub defaults: DefaultsSection,
    /// Replaces the built-in weight table when present.
    pub weights: Weights,
    pub limits: TuneLimits,
    pub history: HistorySection,
    pub synthetic: SyntheticConfig,
}

impl TunerConfig {
    /// Request over `space` with every other field taken from `[defaults]`.
    pub fn base_request(&self, space: ParameterSpace) -> AutoTuneRequest {
        let defaults = &self.defaults;
        AutoTuneRequest {
            space,
            max_rounds: defaults.max_rounds,
            values_per_param: defaults.values_per_param,
            top_k: defaults.top_k,
            objective: defaults.objective,
            weights: self.weights.clone(),
            eval: defaults.eval_settings(),
            data_source: Default::default(),
            convergence_threshold: defaults.convergence_threshold,
            margin_steps: defaults.margin_steps,
        }
    }

    pub fn history_store(&self) -> HistoryResult<Option<SqliteSweepStore>> {
        if !self.history.enabled {
            return Ok(None);
        }
        let store = SqliteSweepStore::new(&self.history.path)?;
        store.initialize()?;
        Ok(Some(store))
    }

    pub fn validate(&self) -> Result<()> {
        let defaults = &self.defaults;
        if defaults.values_per_param < 2 {
            return Err(invalid("defaults.values_per_param", "must be >= 2"));
        }
        if defaults.top_k == 0 {
            return Err(invalid("defaults.top_k", "must be >= 1"));
        }
        if defaults.iterations == 0 {
            return Err(invalid("defaults.iterations", "must be >= 1"));
        }
        if defaults.max_rounds == 0 || defaults.max_rounds > self.limits.max_rounds {
            return Err(invalid(
                "defaults.max_rounds",
                format!("must be between 1 and limits.max_rounds ({})", self.limits.max_rounds),
            ));
        }
        if !defaults.convergence_threshold.is_finite() || defaults.convergence_threshold < 0.0 {
            return Err(invalid("defaults.convergence_threshold", "must be >= 0"));
        }
        if !defaults.margin_steps.is_finite() || defaults.margin_steps < 0.0 {
            return Err(invalid("defaults.margin_steps", "must be >= 0"));
        }
        if self.limits.max_combinations == 0 {
            return Err(invalid("limits.max_combinations", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.synthetic.failure_rate) {
            return Err(invalid("synthetic.failure_rate", "must be within [0, 1]"));
        }
        if !self.synthetic.noise.is_finite() || self.synthetic.noise < 0.0 {
            return Err(invalid("synthetic.noise", "must be >= 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Values used when a request leaves a field out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub max_rounds: usize,
    pub values_per_param: usize,
    pub top_k: usize,
    pub iterations: usize,
    #[serde(with = "serde_duration")]
    pub settle_time: Duration,
    #[serde(with = "serde_duration")]
    pub sample_interval: Duration,
    pub objective: ObjectiveKind,
    pub convergence_threshold: f64,
    pub margin_steps: f64,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        let eval = EvalSettings::default();
        Self {
            max_rounds: 3,
            values_per_param: 5,
            top_k: 5,
            iterations: eval.iterations,
            settle_time: eval.settle_time,
            sample_interval: eval.sample_interval,
            objective: ObjectiveKind::Weighted,
            convergence_threshold: 0.001,
            margin_steps: 1.0,
        }
    }
}

impl DefaultsSection {
    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            iterations: self.iterations,
            settle_time: self.settle_time,
            sample_interval: self.sample_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("sweep_history.db"),
        }
    }
}

pub fn load_tuner_config<P: AsRef<Path>>(path: P) -> Result<TunerConfig> {
    let config: TunerConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

/// Reads a JSON or YAML document, chosen by file extension. Files without a
/// recognised extension are tried as JSON first.
pub fn load_request_file<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let decode_error = |reason: String| ConfigError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") => serde_json::from_str(&content).map_err(|err| decode_error(err.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|err| decode_error(err.to_string()))
        }
        _ => serde_json::from_str(&content).or_else(|json_err| {
            serde_yaml::from_str(&content)
                .map_err(|yaml_err| decode_error(format!("json: {json_err}; yaml: {yaml_err}")))
        }),
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{ParamKind, ParamSpec, ACCEPTANCE_RATE, MISALIGNMENT_RATIO};
    use std::io::Write;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/tuner.toml");
        let config = load_tuner_config(path).expect("tuner.toml should parse");
        assert_eq!(config.defaults.values_per_param, 5);
        assert_eq!(config.defaults.settle_time, Duration::from_secs(5));
        assert_eq!(config.weights.get(ACCEPTANCE_RATE), Some(1.0));
        assert_eq!(config.weights.get(MISALIGNMENT_RATIO), Some(0.5));
        assert_eq!(config.limits.max_combinations, 10_000);
        assert!(config.history.enabled);
        assert_eq!(config.synthetic.optimum["noise_relative"], 0.03);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: TunerConfig = toml::from_str("[defaults]\ntop_k = 3\n").unwrap();
        assert_eq!(config.defaults.top_k, 3);
        assert_eq!(config.defaults.max_rounds, 3);
        assert_eq!(config.weights, Weights::default());
        assert!(!config.history.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_invalid_defaults() {
        let config: TunerConfig = toml::from_str("[defaults]\nvalues_per_param = 1\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "defaults.values_per_param"
        ));
    }

    #[test]
    fn base_request_uses_defaults() {
        let config = TunerConfig::default();
        let space = ParameterSpace::new(vec![
            ParamSpec::range("a", ParamKind::Float, 0.0, 1.0, 0.1).unwrap(),
        ])
        .unwrap();
        let request = config.base_request(space);
        assert_eq!(request.top_k, 5);
        assert_eq!(request.eval, EvalSettings::default());
    }

    #[test]
    fn request_files_decode_json_and_yaml() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Probe {
            name: String,
            values: Vec<f64>,
        }

        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("probe.json");
        std::fs::write(&json, r#"{"name": "a", "values": [1.0, 2.0]}"#).unwrap();
        let yaml = dir.path().join("probe.yml");
        let mut file = std::fs::File::create(&yaml).unwrap();
        writeln!(file, "name: a\nvalues: [1.0, 2.0]").unwrap();

        let expected = Probe {
            name: "a".into(),
            values: vec![1.0, 2.0],
        };
        assert_eq!(load_request_file::<Probe, _>(&json).unwrap(), expected);
        assert_eq!(load_request_file::<Probe, _>(&yaml).unwrap(), expected);

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        assert!(matches!(
            load_request_file::<Probe, _>(&broken),
            Err(ConfigError::Decode { .. })
        ));
    }
}
