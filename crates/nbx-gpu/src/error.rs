use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The requested backend is not present in this build or failed to
    /// initialize.
    #[error("device unavailable: {0}")]
    Unavailable(String),
    /// A backend call failed after initialization.
    #[error("device backend error: {0}")]
    Backend(String),
    /// Sizes, offsets or backend pairings disagree.
    #[error("inconsistent device operation: {0}")]
    Mismatch(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
