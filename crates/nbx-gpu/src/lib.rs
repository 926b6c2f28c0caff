pub mod buffer;
pub mod context;
pub mod error;
pub mod event;
pub mod stream;
pub mod timing;

#[cfg(feature = "cuda")]
mod cuda;

pub use buffer::{over_allocate, DeviceBuffer, DeviceValue, StagingBuffer};
pub use context::{DeviceContext, DeviceSpec, ForceKernelArgs, GatherArgs, PruneKernelArgs};
pub use error::{DeviceError, DeviceResult};
pub use event::DeviceEvent;
pub use stream::DeviceStream;
pub use timing::{OpTiming, TimingSlot};
