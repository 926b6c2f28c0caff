use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unsupported interaction setup: {0}")]
    Unsupported(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("inconsistent input: {0}")]
    Mismatch(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
