//! Per-operation timing accumulators.
//!
//! A [`TimingSlot`] is cloned into the job that performs an operation and
//! updated when the job finishes, so the recorded time covers the work as
//! executed on the stream, not the host-side enqueue.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Accumulated launch count and wall time of one operation category.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OpTiming {
    pub count: u64,
    pub milliseconds: f64,
}

/// Shared handle to one accumulator.
#[derive(Clone, Default)]
pub struct TimingSlot {
    inner: Arc<Mutex<OpTiming>>,
}

impl TimingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, milliseconds: f64) {
        let mut timing = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        timing.count += 1;
        timing.milliseconds += milliseconds;
    }

    pub fn snapshot(&self) -> OpTiming {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1e3
}
