//! Wall-clock accounting of the device operations a step issues.
//!
//! Slots are cloned into the stream jobs that execute the operations, so
//! the recorded time covers the work as it ran, not the enqueue. Counts
//! are per transfer or launch. Disabled entirely when
//! `NBX_DISABLE_GPU_TIMING` is set, in which case no slot is handed to the
//! device layer.

use nbx_gpu::{OpTiming, TimingSlot};

use crate::workload::InteractionLocality;

/// Accumulated operation timings of one locality.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocalityTimings {
    pub pairlist_h2d: OpTiming,
    pub xq_h2d: OpTiming,
    pub force_kernel: OpTiming,
    pub prune_kernel: OpTiming,
    pub f_d2h: OpTiming,
}

/// Snapshot of both localities, as returned by
/// [`NonbondedGpu::timings`](crate::manager::NonbondedGpu::timings).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GpuTimings {
    pub local: LocalityTimings,
    pub nonlocal: LocalityTimings,
}

#[derive(Default)]
struct TimingSlots {
    pairlist_h2d: TimingSlot,
    xq_h2d: TimingSlot,
    force_kernel: TimingSlot,
    prune_kernel: TimingSlot,
    f_d2h: TimingSlot,
}

impl TimingSlots {
    fn snapshot(&self) -> LocalityTimings {
        LocalityTimings {
            pairlist_h2d: self.pairlist_h2d.snapshot(),
            xq_h2d: self.xq_h2d.snapshot(),
            force_kernel: self.force_kernel.snapshot(),
            prune_kernel: self.prune_kernel.snapshot(),
            f_d2h: self.f_d2h.snapshot(),
        }
    }
}

pub(crate) struct TimingState {
    enabled: bool,
    local: TimingSlots,
    nonlocal: TimingSlots,
}

impl TimingState {
    pub(crate) fn from_env() -> Self {
        Self {
            enabled: std::env::var_os("NBX_DISABLE_GPU_TIMING").is_none(),
            local: TimingSlots::default(),
            nonlocal: TimingSlots::default(),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    fn slots(&self, locality: InteractionLocality) -> &TimingSlots {
        match locality {
            InteractionLocality::Local => &self.local,
            InteractionLocality::NonLocal => &self.nonlocal,
        }
    }

    pub(crate) fn pairlist_h2d(&self, locality: InteractionLocality) -> Option<&TimingSlot> {
        self.enabled.then(|| &self.slots(locality).pairlist_h2d)
    }

    pub(crate) fn xq_h2d(&self, locality: InteractionLocality) -> Option<&TimingSlot> {
        self.enabled.then(|| &self.slots(locality).xq_h2d)
    }

    pub(crate) fn force_kernel(&self, locality: InteractionLocality) -> Option<&TimingSlot> {
        self.enabled.then(|| &self.slots(locality).force_kernel)
    }

    pub(crate) fn prune_kernel(&self, locality: InteractionLocality) -> Option<&TimingSlot> {
        self.enabled.then(|| &self.slots(locality).prune_kernel)
    }

    pub(crate) fn f_d2h(&self, locality: InteractionLocality) -> Option<&TimingSlot> {
        self.enabled.then(|| &self.slots(locality).f_d2h)
    }

    pub(crate) fn snapshot(&self) -> GpuTimings {
        GpuTimings {
            local: self.local.snapshot(),
            nonlocal: self.nonlocal.snapshot(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.local = TimingSlots::default();
        self.nonlocal = TimingSlots::default();
    }
}
