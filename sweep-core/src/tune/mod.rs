pub mod engine;
pub mod error;
pub mod objective;
pub mod request;
pub mod session;
pub mod status;

pub use engine::{AutoTuner, TuneOutcome};
pub use error::{TuneError, TuneResult};
pub use objective::{
    dominates, metric_direction, MetricDirection, ObjectiveKind, ObjectiveScorer, Weights,
};
pub use request::{AutoTuneRequest, TuneLimits};
pub use session::TuningService;
pub use status::{
    Recommendation, RoundSummary, SessionMode, StatusReporter, StatusSnapshot, Termination,
    TunerPhase,
};
