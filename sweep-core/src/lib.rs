pub mod api;
pub mod config;
pub mod duration;
pub mod error;
pub mod history;
pub mod sweep;
pub mod tune;

pub use api::{ApiError, ApiResponse, ApiResult, AutoSweepRequest, StatusResponse, SweepApi};
pub use config::{
    load_request_file, load_tuner_config, DefaultsSection, HistorySection, TunerConfig,
};
pub use duration::{format_duration, parse_duration, DurationParseError};
pub use error::{ConfigError, Result};
pub use history::{
    HistoryError, HistoryResult, RunComparison, RunFilter, SqliteSweepStore,
    SqliteSweepStoreBuilder, SweepRunRecord, ValueDelta,
};
pub use sweep::{
    CancelToken, Combination, ComboEvaluator, ComboResult, ComboStats, DataSource, EvalResult,
    EvalSettings, EvaluatorError, ParamKind, ParamSpec, ParamValue, ParameterSpace,
    PipelineEvaluator, SampleStats, SweepError, SweepHandle, SweepOutcome, SweepProgress,
    SweepResult, SweepRunner, SyntheticConfig, SyntheticEvaluator,
};
pub use tune::{
    AutoTuneRequest, AutoTuner, ObjectiveKind, ObjectiveScorer, Recommendation, RoundSummary,
    SessionMode, StatusReporter, StatusSnapshot, Termination, TuneError, TuneLimits, TuneOutcome,
    TuneResult, TunerPhase, TuningService, Weights,
};
