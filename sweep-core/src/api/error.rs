use thiserror::Error;

use crate::duration::DurationParseError;
use crate::sweep::SweepError;
use crate::tune::TuneError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("invalid request: {0}")]
    Duration(#[from] DurationParseError),
    #[error("invalid request: {0}")]
    Sweep(#[from] SweepError),
    #[error(transparent)]
    Tune(#[from] TuneError),
    #[error("failed to encode response: {0}")]
    Encode(serde_json::Error),
    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },
    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Body(_)
            | ApiError::Invalid(_)
            | ApiError::Duration(_)
            | ApiError::Sweep(_) => 400,
            ApiError::Tune(err) if err.is_validation() => 400,
            ApiError::Tune(TuneError::AlreadyRunning { .. }) => 409,
            ApiError::Tune(TuneError::UnknownTarget(_)) => 404,
            ApiError::Tune(_) | ApiError::Encode(_) => 500,
            ApiError::NotFound { .. } => 404,
            ApiError::MethodNotAllowed { .. } => 405,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
