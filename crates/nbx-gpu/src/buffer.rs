//! Device buffers and host staging areas.
//!
//! The host backend keeps buffer contents in plain vectors behind mutexes
//! so stream workers can read and write them; the cuda backend keeps raw
//! device bytes. Logical length and capacity are tracked separately, and
//! growth never preserves contents, so callers re-upload after a growth
//! step.

use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "cuda")]
use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Element types storable in device buffers: plain-data aggregates of
/// 4-byte scalars without padding.
pub trait DeviceValue: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> DeviceValue for T {}

/// Capacity reserved ahead of demand when a buffer grows.
pub fn over_allocate(needed: usize) -> usize {
    (1.19 * needed as f64) as usize + 100
}

/// A poisoning panic can only come from a worker dying mid-job; the
/// guarded data is plain values and stays usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One device-resident array, tied to the backend that allocated it.
pub struct DeviceBuffer<T> {
    storage: Storage<T>,
    len: usize,
    capacity: usize,
}

enum Storage<T> {
    Host(Arc<Mutex<Vec<T>>>),
    #[cfg(feature = "cuda")]
    Cuda {
        bytes: Mutex<cudarc::driver::CudaSlice<u8>>,
        marker: std::marker::PhantomData<T>,
    },
}

impl<T: DeviceValue> DeviceBuffer<T> {
    pub(crate) fn host(len: usize) -> Self {
        Self {
            storage: Storage::Host(Arc::new(Mutex::new(vec![T::default(); len]))),
            len,
            capacity: len,
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda(bytes: cudarc::driver::CudaSlice<u8>, len: usize) -> Self {
        Self {
            storage: Storage::Cuda {
                bytes: Mutex::new(bytes),
                marker: std::marker::PhantomData,
            },
            len,
            capacity: len,
        }
    }

    /// Logical element count; at most [`capacity`](Self::capacity).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
    }

    pub(crate) fn host_storage(&self) -> DeviceResult<&Arc<Mutex<Vec<T>>>> {
        match &self.storage {
            Storage::Host(values) => Ok(values),
            #[cfg(feature = "cuda")]
            Storage::Cuda { .. } => Err(backend_mismatch()),
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda_storage(&self) -> DeviceResult<&Mutex<cudarc::driver::CudaSlice<u8>>> {
        match &self.storage {
            Storage::Cuda { bytes, .. } => Ok(bytes),
            Storage::Host(_) => Err(backend_mismatch()),
        }
    }
}

#[cfg(feature = "cuda")]
fn backend_mismatch() -> DeviceError {
    DeviceError::Mismatch("buffer storage does not match the active backend".into())
}

/// Host-side landing area for downloads; read after synchronizing the
/// stream that carried the download.
pub struct StagingBuffer<T> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: DeviceValue> StagingBuffer<T> {
    pub fn new(len: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![T::default(); len])),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `read` against the staged contents.
    pub fn with<R>(&self, read: impl FnOnce(&[T]) -> R) -> R {
        let values = lock(&self.data);
        read(&values)
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_allocation_adds_headroom() {
        assert_eq!(over_allocate(0), 100);
        assert_eq!(over_allocate(1000), 1290);
        for n in [1usize, 7, 64, 4096] {
            assert!(over_allocate(n) > n);
        }
    }

    #[test]
    fn host_buffer_tracks_len_and_capacity() {
        let mut buffer = DeviceBuffer::<f32>::host(8);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.capacity(), 8);
        buffer.set_len(3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    fn staging_buffer_starts_zeroed() {
        let staging = StagingBuffer::<f32>::new(5);
        assert_eq!(staging.len(), 5);
        staging.with(|values| assert!(values.iter().all(|v| *v == 0.0)));
    }
}
