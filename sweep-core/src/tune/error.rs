use thiserror::Error;
use uuid::Uuid;

use crate::sweep::SweepError;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("invalid request: {0}")]
    Sweep(#[from] SweepError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("a tuning session is already running for {target} ({session_id})")]
    AlreadyRunning { target: String, session_id: Uuid },
    #[error("no pipeline evaluator registered for target {0}")]
    UnknownTarget(String),
    #[error("tuning task for {target} failed: {reason}")]
    TaskFailed { target: String, reason: String },
}

impl TuneError {
    /// Errors caused by the caller's input rather than the service state.
    pub fn is_validation(&self) -> bool {
        matches!(self, TuneError::Sweep(_) | TuneError::InvalidRequest(_))
    }
}

pub type TuneResult<T> = std::result::Result<T, TuneError>;
