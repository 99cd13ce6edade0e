pub mod cancel;
pub mod error;
pub mod evaluator;
pub mod result;
pub mod runner;
pub mod space;
pub mod synthetic;

pub use cancel::CancelToken;
pub use error::{SweepError, SweepResult};
pub use evaluator::{
    ComboEvaluator, DataSource, EvalResult, EvalSettings, EvaluatorError, PipelineEvaluator,
};
pub use result::{
    ComboResult, ComboStats, MetricSummary, SampleStats, ACCEPTANCE_RATE, ACTIVE_TRACKS,
    ALIGNMENT_DEG, MISALIGNMENT_RATIO, NONZERO_CELLS,
};
pub use runner::{
    SharedProgress, SweepEvent, SweepHandle, SweepOutcome, SweepProgress, SweepRunner,
};
pub use space::{Combination, ParamDomain, ParamKind, ParamSpec, ParamValue, ParameterSpace};
pub use synthetic::{SyntheticConfig, SyntheticEvaluator};
