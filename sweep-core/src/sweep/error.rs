use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("parameter space must contain at least one parameter")]
    EmptySpace,
    #[error("duplicate parameter name: {0}")]
    DuplicateParam(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("values_per_param must be >= 2, got {0}")]
    TooFewValues(usize),
    #[error("sweep would evaluate {count} combinations, limit is {limit}")]
    TooManyCombinations { count: usize, limit: usize },
    #[error("cannot narrow from an empty selection")]
    EmptySelection,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type SweepResult<T> = std::result::Result<T, SweepError>;
