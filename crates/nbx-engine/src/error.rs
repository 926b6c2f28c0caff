use nbx_core::CoreError;
use nbx_gpu::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested interaction combination has no kernel flavor.
    #[error("unsupported nonbonded setup: {0}")]
    UnsupportedVariant(String),
    /// The engine was configured or driven in a way it cannot honor.
    #[error("invalid engine configuration: {0}")]
    InvalidConfiguration(String),
    /// The pair list was built for a different cluster geometry than the
    /// kernels run.
    #[error("pair list built for {list} atoms per cluster, kernels run {kernel}")]
    ClusterSizeMismatch { list: usize, kernel: usize },
    /// Host inputs disagree with the device-resident state.
    #[error("inconsistent engine input: {0}")]
    Mismatch(String),
    #[error("interaction setup: {0}")]
    Core(#[from] CoreError),
    #[error("device layer: {0}")]
    Device(#[from] DeviceError),
}

pub type EngineResult<T> = Result<T, EngineError>;
