//! The device context: backend selection, kernel setup and every buffer
//! or kernel operation issued onto a stream.
//!
//! Host-backed jobs that touch several buffers take their locks in one
//! fixed role order (coordinates, forces, shift forces, energies, list
//! entries, interaction masks, parameter tables, raw coordinate inputs,
//! staging) so concurrent streams cannot deadlock on each other.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use nbx_core::kernel::{
    AtomDataView, ForceKernelFlags, ForceKernelFn, ForceOutputs, KernelConsts, PairTables,
};
use nbx_core::layout::FILLER_COORDINATE;
use nbx_core::params::KernelSetup;
use nbx_core::{
    force_kernel_for, prune_kernel, Cj4Entry, ExclEntry, Float2, Float3, Float4, SciEntry,
};

use crate::buffer::{lock, over_allocate, DeviceBuffer, DeviceValue, StagingBuffer};
use crate::error::{DeviceError, DeviceResult};
use crate::event::DeviceEvent;
use crate::stream::{DeviceStream, HostStream, StreamImpl};
use crate::timing::{elapsed_ms, TimingSlot};

/// Which backend to run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Reference kernels on stream worker threads.
    Host,
    /// Cuda when built in and initializable, host otherwise.
    Auto,
    Cuda {
        ordinal: usize,
    },
}

impl FromStr for DeviceSpec {
    type Err = DeviceError;

    fn from_str(value: &str) -> DeviceResult<Self> {
        match value {
            "cpu" | "host" => Ok(Self::Host),
            "auto" => Ok(Self::Auto),
            "cuda" => Ok(Self::Cuda { ordinal: 0 }),
            other => match other.strip_prefix("cuda:") {
                Some(ordinal) => ordinal
                    .parse::<usize>()
                    .map(|ordinal| Self::Cuda { ordinal })
                    .map_err(|_| {
                        DeviceError::Mismatch(format!("malformed device ordinal in '{other}'"))
                    }),
                None => Err(DeviceError::Mismatch(format!(
                    "unknown device spec '{other}'"
                ))),
            },
        }
    }
}

/// Device-resident operands of one force-kernel launch.
pub struct ForceKernelArgs<'a> {
    pub xq: &'a DeviceBuffer<Float4>,
    pub f: &'a DeviceBuffer<Float3>,
    pub fshift: &'a DeviceBuffer<Float3>,
    pub e_lj: &'a DeviceBuffer<f32>,
    pub e_el: &'a DeviceBuffer<f32>,
    pub sci: &'a DeviceBuffer<SciEntry>,
    pub cj4: &'a DeviceBuffer<Cj4Entry>,
    pub excl: &'a DeviceBuffer<ExclEntry>,
    pub atom_types: &'a DeviceBuffer<i32>,
    pub lj_comb: &'a DeviceBuffer<Float2>,
    pub shift_vec: &'a DeviceBuffer<Float3>,
    pub nbfp: &'a DeviceBuffer<Float2>,
    pub nbfp_comb: &'a DeviceBuffer<Float2>,
    pub coulomb_tab: &'a DeviceBuffer<f32>,
    pub num_sci: usize,
    pub consts: KernelConsts,
    pub flags: ForceKernelFlags,
}

/// Device-resident operands of one prune-only launch.
pub struct PruneKernelArgs<'a> {
    pub xq: &'a DeviceBuffer<Float4>,
    pub shift_vec: &'a DeviceBuffer<Float3>,
    pub sci: &'a DeviceBuffer<SciEntry>,
    pub cj4: &'a DeviceBuffer<Cj4Entry>,
    pub saved_imask: &'a DeviceBuffer<u32>,
    pub num_sci: usize,
    pub consts: KernelConsts,
    pub have_fresh_list: bool,
    pub num_parts: usize,
    pub part: usize,
}

/// Operands of the coordinate gather that packs `x` and charges into the
/// clustered xq layout, writing filler slots where the index is negative.
pub struct GatherArgs<'a> {
    pub x: &'a DeviceBuffer<Float3>,
    pub charges: &'a DeviceBuffer<f32>,
    pub atom_index: &'a DeviceBuffer<i32>,
    pub num_slots: usize,
    pub xq: &'a DeviceBuffer<Float4>,
}

pub struct DeviceContext {
    backend: BackendImpl,
    setup: KernelSetup,
    force_fn: ForceKernelFn,
}

enum BackendImpl {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(crate::cuda::CudaBackend),
}

impl DeviceContext {
    /// Builds a context running the given kernel flavor pair. The flavors
    /// are fixed per context; the cuda backend compiles its module for
    /// exactly this pair.
    pub fn new(spec: DeviceSpec, setup: KernelSetup) -> DeviceResult<Self> {
        let backend = match spec {
            DeviceSpec::Host => BackendImpl::Host,
            DeviceSpec::Cuda { ordinal } => Self::cuda_backend(ordinal, setup)?,
            DeviceSpec::Auto => match Self::cuda_backend(0, setup) {
                Ok(backend) => backend,
                Err(err) => {
                    log::debug!("auto device selection falling back to host: {err}");
                    BackendImpl::Host
                }
            },
        };
        let context = Self {
            backend,
            setup,
            force_fn: force_kernel_for(setup),
        };
        log::debug!(
            "nonbonded device context on {} backend ({:?}/{:?})",
            context.backend_name(),
            setup.elec,
            setup.vdw
        );
        Ok(context)
    }

    #[cfg(feature = "cuda")]
    fn cuda_backend(ordinal: usize, setup: KernelSetup) -> DeviceResult<BackendImpl> {
        Ok(BackendImpl::Cuda(crate::cuda::CudaBackend::new(
            ordinal, setup,
        )?))
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda_backend(_ordinal: usize, _setup: KernelSetup) -> DeviceResult<BackendImpl> {
        Err(DeviceError::Unavailable(
            "cuda feature disabled; rebuild with --features cuda".into(),
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            BackendImpl::Host => "host",
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(_) => "cuda",
        }
    }

    pub fn setup(&self) -> KernelSetup {
        self.setup
    }

    pub fn new_stream(&self, label: &str) -> DeviceResult<DeviceStream> {
        match &self.backend {
            BackendImpl::Host => Ok(DeviceStream {
                inner: StreamImpl::Host(HostStream::spawn(label)?),
            }),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => Ok(DeviceStream {
                inner: StreamImpl::Cuda(cuda.new_stream()?),
            }),
        }
    }

    pub fn new_event(&self) -> DeviceResult<DeviceEvent> {
        match &self.backend {
            BackendImpl::Host => Ok(DeviceEvent::host()),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.new_event(),
        }
    }

    /// Allocates a zero-filled buffer whose length equals its capacity.
    pub fn alloc<T: DeviceValue>(&self, len: usize) -> DeviceResult<DeviceBuffer<T>> {
        match &self.backend {
            BackendImpl::Host => Ok(DeviceBuffer::host(len)),
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.alloc::<T>(len),
        }
    }

    /// Ensures capacity for `needed` elements and sets the logical length.
    /// Returns whether the buffer was reallocated; reallocation zeroes the
    /// contents, so callers re-upload what must survive.
    pub fn reserve<T: DeviceValue>(
        &self,
        buffer: &mut DeviceBuffer<T>,
        needed: usize,
    ) -> DeviceResult<bool> {
        if needed <= buffer.capacity() {
            buffer.set_len(needed);
            return Ok(false);
        }
        let mut grown = self.alloc::<T>(over_allocate(needed))?;
        grown.set_len(needed);
        *buffer = grown;
        Ok(true)
    }

    /// Stream-ordered host-to-device copy of `data` into `buffer` starting
    /// at element `offset`.
    pub fn upload<T: DeviceValue>(
        &self,
        stream: &DeviceStream,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        data: &[T],
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() > buffer.capacity() {
            return Err(DeviceError::Mismatch(format!(
                "upload of {} elements at offset {offset} exceeds capacity {}",
                data.len(),
                buffer.capacity()
            )));
        }
        match &self.backend {
            BackendImpl::Host => {
                let storage = Arc::clone(buffer.host_storage()?);
                let data = data.to_vec();
                let timing = timing.cloned();
                stream.host()?.enqueue(Box::new(move || {
                    let started = Instant::now();
                    let mut values = lock(&storage);
                    values[offset..offset + data.len()].copy_from_slice(&data);
                    if let Some(slot) = timing {
                        slot.record(elapsed_ms(started));
                    }
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.upload(stream.cuda()?, buffer, offset, data, timing),
        }
    }

    /// Stream-ordered device-to-host copy of `count` elements starting at
    /// element `offset` into the front of `staging`.
    pub fn download<T: DeviceValue>(
        &self,
        stream: &DeviceStream,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        count: usize,
        staging: &StagingBuffer<T>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        if count == 0 {
            return Ok(());
        }
        if offset + count > buffer.capacity() {
            return Err(DeviceError::Mismatch(format!(
                "download of {count} elements at offset {offset} exceeds capacity {}",
                buffer.capacity()
            )));
        }
        if count > staging.len() {
            return Err(DeviceError::Mismatch(format!(
                "staging of {} elements cannot hold {count}",
                staging.len()
            )));
        }
        match &self.backend {
            BackendImpl::Host => {
                let storage = Arc::clone(buffer.host_storage()?);
                let staging = staging.shared();
                let timing = timing.cloned();
                stream.host()?.enqueue(Box::new(move || {
                    let started = Instant::now();
                    let values = lock(&storage);
                    let mut landed = lock(&staging);
                    landed[..count].copy_from_slice(&values[offset..offset + count]);
                    if let Some(slot) = timing {
                        slot.record(elapsed_ms(started));
                    }
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => {
                cuda.download(stream.cuda()?, buffer, offset, count, staging, timing)
            }
        }
    }

    /// Stream-ordered zero fill of the first `count` elements.
    pub fn clear<T: DeviceValue>(
        &self,
        stream: &DeviceStream,
        buffer: &DeviceBuffer<T>,
        count: usize,
    ) -> DeviceResult<()> {
        if count == 0 {
            return Ok(());
        }
        if count > buffer.capacity() {
            return Err(DeviceError::Mismatch(format!(
                "clear of {count} elements exceeds capacity {}",
                buffer.capacity()
            )));
        }
        match &self.backend {
            BackendImpl::Host => {
                let storage = Arc::clone(buffer.host_storage()?);
                stream.host()?.enqueue(Box::new(move || {
                    let mut values = lock(&storage);
                    values[..count].fill(T::default());
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.clear::<T>(stream.cuda()?, buffer, count),
        }
    }

    /// Launches the force kernel over the first `num_sci` list entries.
    pub fn launch_force_kernel(
        &self,
        stream: &DeviceStream,
        args: &ForceKernelArgs<'_>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        if args.num_sci == 0 {
            return Ok(());
        }
        if args.num_sci > args.sci.len() {
            return Err(DeviceError::Mismatch(format!(
                "force launch over {} entries but the list holds {}",
                args.num_sci,
                args.sci.len()
            )));
        }
        match &self.backend {
            BackendImpl::Host => {
                let force_fn = self.force_fn;
                let xq = Arc::clone(args.xq.host_storage()?);
                let f = Arc::clone(args.f.host_storage()?);
                let fshift = Arc::clone(args.fshift.host_storage()?);
                let e_lj = Arc::clone(args.e_lj.host_storage()?);
                let e_el = Arc::clone(args.e_el.host_storage()?);
                let sci = Arc::clone(args.sci.host_storage()?);
                let cj4 = Arc::clone(args.cj4.host_storage()?);
                let excl = Arc::clone(args.excl.host_storage()?);
                let atom_types = Arc::clone(args.atom_types.host_storage()?);
                let lj_comb = Arc::clone(args.lj_comb.host_storage()?);
                let shift_vec = Arc::clone(args.shift_vec.host_storage()?);
                let nbfp = Arc::clone(args.nbfp.host_storage()?);
                let nbfp_comb = Arc::clone(args.nbfp_comb.host_storage()?);
                let coulomb_tab = Arc::clone(args.coulomb_tab.host_storage()?);
                let consts = args.consts;
                let flags = args.flags;
                let num_sci = args.num_sci;
                let timing = timing.cloned();
                stream.host()?.enqueue(Box::new(move || {
                    let started = Instant::now();
                    let xq = lock(&xq);
                    let mut f = lock(&f);
                    let mut fshift = lock(&fshift);
                    let mut e_lj = lock(&e_lj);
                    let mut e_el = lock(&e_el);
                    let sci = lock(&sci);
                    let mut cj4 = lock(&cj4);
                    let excl = lock(&excl);
                    let atom_types = lock(&atom_types);
                    let lj_comb = lock(&lj_comb);
                    let shift_vec = lock(&shift_vec);
                    let nbfp = lock(&nbfp);
                    let nbfp_comb = lock(&nbfp_comb);
                    let coulomb_tab = lock(&coulomb_tab);
                    let atoms = AtomDataView {
                        xq: xq.as_slice(),
                        atom_types: atom_types.as_slice(),
                        lj_comb: lj_comb.as_slice(),
                        shift_vec: shift_vec.as_slice(),
                    };
                    let tables = PairTables {
                        nbfp: nbfp.as_slice(),
                        nbfp_comb: nbfp_comb.as_slice(),
                        ntypes: consts.ntypes,
                    };
                    let mut outputs = ForceOutputs {
                        f: f.as_mut_slice(),
                        fshift: fshift.as_mut_slice(),
                        e_lj: e_lj.as_mut_slice(),
                        e_el: e_el.as_mut_slice(),
                    };
                    force_fn(
                        &sci[..num_sci],
                        cj4.as_mut_slice(),
                        excl.as_slice(),
                        &atoms,
                        &consts,
                        &tables,
                        coulomb_tab.as_slice(),
                        &mut outputs,
                        flags,
                    );
                    if let Some(slot) = timing {
                        slot.record(elapsed_ms(started));
                    }
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.launch_force_kernel(
                stream.cuda()?,
                args,
                self.setup.vdw.uses_lj_comb(),
                timing,
            ),
        }
    }

    /// Launches the prune-only kernel over one rolling part of the list.
    pub fn launch_prune_kernel(
        &self,
        stream: &DeviceStream,
        args: &PruneKernelArgs<'_>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        if args.num_parts == 0 || args.part >= args.num_parts {
            return Err(DeviceError::Mismatch(format!(
                "prune part {} of {} parts is out of range",
                args.part, args.num_parts
            )));
        }
        if args.num_sci == 0 {
            return Ok(());
        }
        if args.num_sci > args.sci.len() {
            return Err(DeviceError::Mismatch(format!(
                "prune launch over {} entries but the list holds {}",
                args.num_sci,
                args.sci.len()
            )));
        }
        if args.saved_imask.len() < args.cj4.len() {
            return Err(DeviceError::Mismatch(
                "saved interaction masks shorter than the cluster-pair table".into(),
            ));
        }
        match &self.backend {
            BackendImpl::Host => {
                let xq = Arc::clone(args.xq.host_storage()?);
                let sci = Arc::clone(args.sci.host_storage()?);
                let cj4 = Arc::clone(args.cj4.host_storage()?);
                let saved_imask = Arc::clone(args.saved_imask.host_storage()?);
                let shift_vec = Arc::clone(args.shift_vec.host_storage()?);
                let consts = args.consts;
                let have_fresh_list = args.have_fresh_list;
                let num_parts = args.num_parts;
                let part = args.part;
                let num_sci = args.num_sci;
                let timing = timing.cloned();
                stream.host()?.enqueue(Box::new(move || {
                    let started = Instant::now();
                    let xq = lock(&xq);
                    let sci = lock(&sci);
                    let mut cj4 = lock(&cj4);
                    let mut saved_imask = lock(&saved_imask);
                    let shift_vec = lock(&shift_vec);
                    let atoms = AtomDataView {
                        xq: xq.as_slice(),
                        atom_types: &[],
                        lj_comb: &[],
                        shift_vec: shift_vec.as_slice(),
                    };
                    prune_kernel(
                        &sci[..num_sci],
                        cj4.as_mut_slice(),
                        saved_imask.as_mut_slice(),
                        &atoms,
                        &consts,
                        have_fresh_list,
                        num_parts,
                        part,
                    );
                    if let Some(slot) = timing {
                        slot.record(elapsed_ms(started));
                    }
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.launch_prune_kernel(stream.cuda()?, args, timing),
        }
    }

    /// Launches the coordinate gather into the clustered xq layout.
    pub fn launch_gather_kernel(
        &self,
        stream: &DeviceStream,
        args: &GatherArgs<'_>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        if args.num_slots == 0 {
            return Ok(());
        }
        if args.num_slots > args.atom_index.len() || args.num_slots > args.xq.capacity() {
            return Err(DeviceError::Mismatch(format!(
                "gather over {} slots exceeds index length {} or xq capacity {}",
                args.num_slots,
                args.atom_index.len(),
                args.xq.capacity()
            )));
        }
        match &self.backend {
            BackendImpl::Host => {
                let xq = Arc::clone(args.xq.host_storage()?);
                let x = Arc::clone(args.x.host_storage()?);
                let charges = Arc::clone(args.charges.host_storage()?);
                let atom_index = Arc::clone(args.atom_index.host_storage()?);
                let num_slots = args.num_slots;
                let timing = timing.cloned();
                stream.host()?.enqueue(Box::new(move || {
                    let started = Instant::now();
                    let mut xq = lock(&xq);
                    let x = lock(&x);
                    let charges = lock(&charges);
                    let atom_index = lock(&atom_index);
                    for slot in 0..num_slots {
                        let ai = atom_index[slot];
                        xq[slot] = if ai < 0 {
                            Float4::new(
                                FILLER_COORDINATE,
                                FILLER_COORDINATE,
                                FILLER_COORDINATE,
                                0.0,
                            )
                        } else {
                            let p = x[ai as usize];
                            Float4::new(p.x, p.y, p.z, charges[ai as usize])
                        };
                    }
                    if let Some(slot) = timing {
                        slot.record(elapsed_ms(started));
                    }
                }))
            }
            #[cfg(feature = "cuda")]
            BackendImpl::Cuda(cuda) => cuda.launch_gather_kernel(stream.cuda()?, args, timing),
        }
    }
}
