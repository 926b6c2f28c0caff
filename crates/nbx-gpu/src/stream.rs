//! Ordered work queues.
//!
//! A stream executes its operations in enqueue order and runs concurrently
//! with other streams; cross-stream ordering goes through
//! [`DeviceEvent`](crate::event::DeviceEvent). The host backend gives each
//! stream a dedicated worker thread, the cuda backend maps directly onto a
//! driver stream.

use std::sync::mpsc;
use std::thread;

use crate::error::{DeviceError, DeviceResult};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum HostCommand {
    Run(Job),
    Fence(mpsc::Sender<()>),
}

pub struct DeviceStream {
    pub(crate) inner: StreamImpl,
}

pub(crate) enum StreamImpl {
    Host(HostStream),
    #[cfg(feature = "cuda")]
    Cuda(std::sync::Arc<cudarc::driver::CudaStream>),
}

pub(crate) struct HostStream {
    sender: Option<mpsc::Sender<HostCommand>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl HostStream {
    pub(crate) fn spawn(label: &str) -> DeviceResult<Self> {
        let (sender, receiver) = mpsc::channel::<HostCommand>();
        let worker = thread::Builder::new()
            .name(format!("nbx-stream-{label}"))
            .spawn(move || {
                for command in receiver {
                    match command {
                        HostCommand::Run(job) => job(),
                        HostCommand::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|err| DeviceError::Backend(format!("stream worker spawn failed: {err}")))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub(crate) fn enqueue(&self, job: Job) -> DeviceResult<()> {
        match &self.sender {
            Some(sender) => sender
                .send(HostCommand::Run(job))
                .map_err(|_| worker_exited()),
            None => Err(worker_exited()),
        }
    }

    fn synchronize(&self) -> DeviceResult<()> {
        let (done, ready) = mpsc::channel();
        match &self.sender {
            Some(sender) => sender
                .send(HostCommand::Fence(done))
                .map_err(|_| worker_exited())?,
            None => return Err(worker_exited()),
        }
        ready.recv().map_err(|_| worker_exited())
    }
}

fn worker_exited() -> DeviceError {
    DeviceError::Backend("stream worker exited".into())
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl DeviceStream {
    /// Blocks until every operation enqueued so far has completed.
    pub fn synchronize(&self) -> DeviceResult<()> {
        match &self.inner {
            StreamImpl::Host(stream) => stream.synchronize(),
            #[cfg(feature = "cuda")]
            StreamImpl::Cuda(stream) => stream.synchronize().map_err(crate::cuda::map_driver_err),
        }
    }

    pub(crate) fn host(&self) -> DeviceResult<&HostStream> {
        match &self.inner {
            StreamImpl::Host(stream) => Ok(stream),
            #[cfg(feature = "cuda")]
            StreamImpl::Cuda(_) => Err(stream_mismatch()),
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda(&self) -> DeviceResult<&std::sync::Arc<cudarc::driver::CudaStream>> {
        match &self.inner {
            StreamImpl::Cuda(stream) => Ok(stream),
            StreamImpl::Host(_) => Err(stream_mismatch()),
        }
    }
}

#[cfg(feature = "cuda")]
fn stream_mismatch() -> DeviceError {
    DeviceError::Mismatch("stream does not belong to the active backend".into())
}
