pub mod error;
pub mod manager;
pub mod timings;
pub mod workload;

pub use error::{EngineError, EngineResult};
pub use manager::{AtomDataHost, NonbondedGpu, StepOutputs};
pub use nbx_gpu::DeviceSpec;
pub use timings::{GpuTimings, LocalityTimings};
pub use workload::{AtomLocality, InteractionLocality, StepWorkload};

#[cfg(test)]
mod tests;
