//! Cross-stream ordering points.
//!
//! An event is marked on one stream and waited on from another; the wait
//! releases once the matching mark has executed. Marks and waits pair one
//! to one. A mark whose consumer was skipped is dropped with
//! [`DeviceEvent::reset`] before the event is reused.
//!
//! The host backend carries marks as channel tokens: marking enqueues a
//! send, waiting enqueues a blocking receive, so a wait enqueued before
//! the mark has run still blocks until the mark executes.

use std::sync::{mpsc, Arc, Mutex};

#[cfg(feature = "cuda")]
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::stream::{DeviceStream, StreamImpl};

pub struct DeviceEvent {
    inner: EventImpl,
}

enum EventImpl {
    Host {
        tokens: mpsc::Sender<()>,
        pending: Arc<Mutex<mpsc::Receiver<()>>>,
    },
    #[cfg(feature = "cuda")]
    Cuda(cudarc::driver::CudaEvent),
}

impl DeviceEvent {
    pub(crate) fn host() -> Self {
        let (tokens, pending) = mpsc::channel();
        Self {
            inner: EventImpl::Host {
                tokens,
                pending: Arc::new(Mutex::new(pending)),
            },
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda(event: cudarc::driver::CudaEvent) -> Self {
        Self {
            inner: EventImpl::Cuda(event),
        }
    }

    /// Records the event behind the work already enqueued on `stream`.
    pub fn mark(&self, stream: &DeviceStream) -> DeviceResult<()> {
        match (&self.inner, &stream.inner) {
            (EventImpl::Host { tokens, .. }, StreamImpl::Host(_)) => {
                let tokens = tokens.clone();
                stream.host()?.enqueue(Box::new(move || {
                    let _ = tokens.send(());
                }))
            }
            #[cfg(feature = "cuda")]
            (EventImpl::Cuda(event), StreamImpl::Cuda(cuda)) => {
                event.record(cuda).map_err(crate::cuda::map_driver_err)
            }
            #[cfg(feature = "cuda")]
            _ => Err(event_mismatch()),
        }
    }

    /// Makes `stream` hold further work until the pending mark has run.
    pub fn wait_on(&self, stream: &DeviceStream) -> DeviceResult<()> {
        match (&self.inner, &stream.inner) {
            (EventImpl::Host { pending, .. }, StreamImpl::Host(_)) => {
                let pending = Arc::clone(pending);
                stream.host()?.enqueue(Box::new(move || {
                    let receiver = match pending.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let _ = receiver.recv();
                }))
            }
            #[cfg(feature = "cuda")]
            (EventImpl::Cuda(event), StreamImpl::Cuda(cuda)) => {
                cuda.wait(event).map_err(crate::cuda::map_driver_err)
            }
            #[cfg(feature = "cuda")]
            _ => Err(event_mismatch()),
        }
    }

    /// Discards a mark that no consumer will wait for. Ordered behind the
    /// work already enqueued on the marking stream, so an in-flight mark
    /// is drained rather than leaking into the next pairing.
    pub fn reset(&self, marking_stream: &DeviceStream) -> DeviceResult<()> {
        match (&self.inner, &marking_stream.inner) {
            (EventImpl::Host { pending, .. }, StreamImpl::Host(_)) => {
                let pending = Arc::clone(pending);
                marking_stream.host()?.enqueue(Box::new(move || {
                    let receiver = match pending.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    while receiver.try_recv().is_ok() {}
                }))
            }
            #[cfg(feature = "cuda")]
            (EventImpl::Cuda(_), StreamImpl::Cuda(_)) => Ok(()),
            #[cfg(feature = "cuda")]
            _ => Err(event_mismatch()),
        }
    }
}

#[cfg(feature = "cuda")]
fn event_mismatch() -> DeviceError {
    DeviceError::Mismatch("event and stream belong to different backends".into())
}
