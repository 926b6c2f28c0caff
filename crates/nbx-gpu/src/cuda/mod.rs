//! Cuda backend: one nvrtc module per kernel flavor pair, compiled with
//! the matching preprocessor defines, plus byte-level buffer plumbing.

use std::sync::Arc;
use std::time::Instant;

use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, DeviceRepr, LaunchConfig,
    PushKernelArg,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use nbx_core::kernel::KernelConsts;
use nbx_core::layout::{
    force_kernel_launch_config, prune_kernel_launch_config, KernelLaunchConfig,
};
use nbx_core::params::{ElecKind, KernelSetup, VdwKind};
use nbx_kernels::KERNELS_SRC;

use crate::buffer::{lock, DeviceBuffer, DeviceValue, StagingBuffer};
use crate::context::{ForceKernelArgs, GatherArgs, PruneKernelArgs};
use crate::error::{DeviceError, DeviceResult};
use crate::event::DeviceEvent;
use crate::timing::{elapsed_ms, TimingSlot};

/// Scalar kernel constants in the device struct layout; field order
/// matches the struct in the embedded kernel source byte for byte.
#[repr(C)]
#[derive(Clone, Copy)]
struct DevKernelConsts {
    ntypes: i32,
    epsfac: f32,
    c_rf: f32,
    two_k_rf: f32,
    ewald_beta: f32,
    sh_ewald: f32,
    sh_lj_ewald: f32,
    lje_coeff2: f32,
    lje_coeff6_6: f32,
    coulomb_tab_scale: f32,
    rcoulomb_sq: f32,
    rvdw_sq: f32,
    rvdw_switch: f32,
    rlist_outer_sq: f32,
    rlist_inner_sq: f32,
    disp_c2: f32,
    disp_c3: f32,
    disp_cpot: f32,
    repu_c2: f32,
    repu_c3: f32,
    repu_cpot: f32,
    sw_c3: f32,
    sw_c4: f32,
    sw_c5: f32,
}

unsafe impl DeviceRepr for DevKernelConsts {}

impl From<&KernelConsts> for DevKernelConsts {
    fn from(consts: &KernelConsts) -> Self {
        Self {
            ntypes: consts.ntypes as i32,
            epsfac: consts.epsfac,
            c_rf: consts.c_rf,
            two_k_rf: consts.two_k_rf,
            ewald_beta: consts.ewald_beta,
            sh_ewald: consts.sh_ewald,
            sh_lj_ewald: consts.sh_lj_ewald,
            lje_coeff2: consts.lje_coeff2,
            lje_coeff6_6: consts.lje_coeff6_6,
            coulomb_tab_scale: consts.coulomb_tab_scale,
            rcoulomb_sq: consts.rcoulomb_sq,
            rvdw_sq: consts.rvdw_sq,
            rvdw_switch: consts.rvdw_switch,
            rlist_outer_sq: consts.rlist_outer_sq,
            rlist_inner_sq: consts.rlist_inner_sq,
            disp_c2: consts.dispersion_shift.c2,
            disp_c3: consts.dispersion_shift.c3,
            disp_cpot: consts.dispersion_shift.cpot,
            repu_c2: consts.repulsion_shift.c2,
            repu_c3: consts.repulsion_shift.c3,
            repu_cpot: consts.repulsion_shift.cpot,
            sw_c3: consts.vdw_switch.c3,
            sw_c4: consts.vdw_switch.c4,
            sw_c5: consts.vdw_switch.c5,
        }
    }
}

/// Preprocessor defines selecting the electrostatics and VdW flavor of
/// the compiled module.
fn flavor_defines(setup: KernelSetup) -> Vec<&'static str> {
    let mut defines = Vec::new();
    match setup.elec {
        ElecKind::Cutoff => defines.push("EL_CUTOFF"),
        ElecKind::ReactionField => defines.push("EL_RF"),
        ElecKind::EwaldAnalytical => defines.push("EL_EWALD_ANA"),
        ElecKind::EwaldAnalyticalTwin => {
            defines.push("EL_EWALD_ANA");
            defines.push("EL_EWALD_TWIN");
        }
        ElecKind::EwaldTabulated => defines.push("EL_EWALD_TAB"),
        ElecKind::EwaldTabulatedTwin => {
            defines.push("EL_EWALD_TAB");
            defines.push("EL_EWALD_TWIN");
        }
    }
    match setup.vdw {
        VdwKind::Cutoff => defines.push("LJ_CUTOFF"),
        VdwKind::CutoffCombGeom => defines.push("LJ_COMB_GEOM"),
        VdwKind::CutoffCombLB => defines.push("LJ_COMB_LB"),
        VdwKind::ForceSwitch => defines.push("LJ_FORCE_SWITCH"),
        VdwKind::PotSwitch => defines.push("LJ_POT_SWITCH"),
        VdwKind::EwaldCombGeom => defines.push("LJ_EWALD_GEOM"),
        VdwKind::EwaldCombLB => defines.push("LJ_EWALD_LB"),
    }
    defines
}

struct Kernels {
    force: Arc<CudaFunction>,
    force_energy: Arc<CudaFunction>,
    force_prune: Arc<CudaFunction>,
    force_energy_prune: Arc<CudaFunction>,
    prune_fresh: Arc<CudaFunction>,
    prune_rolling: Arc<CudaFunction>,
    gather_x: Arc<CudaFunction>,
}

impl Kernels {
    fn load(module: &Arc<CudaModule>) -> DeviceResult<Self> {
        let load = |name: &str| -> DeviceResult<Arc<CudaFunction>> {
            module
                .load_function(name)
                .map_err(|err| {
                    DeviceError::Backend(format!("cuda kernel load '{name}' failed: {err}"))
                })
                .map(Arc::new)
        };
        Ok(Self {
            force: load("nbx_force_kernel")?,
            force_energy: load("nbx_force_kernel_ener")?,
            force_prune: load("nbx_force_kernel_prune")?,
            force_energy_prune: load("nbx_force_kernel_ener_prune")?,
            prune_fresh: load("nbx_prune_kernel_fresh")?,
            prune_rolling: load("nbx_prune_kernel_rolling")?,
            gather_x: load("nbx_gather_x_kernel")?,
        })
    }
}

pub(crate) struct CudaBackend {
    ctx: Arc<CudaContext>,
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    kernels: Kernels,
    alloc_stream: Arc<CudaStream>,
}

impl CudaBackend {
    pub(crate) fn new(ordinal: usize, setup: KernelSetup) -> DeviceResult<Self> {
        let ctx = CudaContext::new(ordinal).map_err(map_driver_err)?;
        let alloc_stream = ctx.default_stream();
        let opts = CompileOptions {
            options: flavor_defines(setup)
                .iter()
                .map(|define| format!("-D{define}"))
                .collect(),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(KERNELS_SRC, opts).map_err(map_compile_err)?;
        let module = ctx.load_module(ptx).map_err(map_driver_err)?;
        let kernels = Kernels::load(&module)?;
        Ok(Self {
            ctx,
            module,
            kernels,
            alloc_stream,
        })
    }

    pub(crate) fn new_stream(&self) -> DeviceResult<Arc<CudaStream>> {
        self.ctx.new_stream().map_err(map_driver_err)
    }

    pub(crate) fn new_event(&self) -> DeviceResult<DeviceEvent> {
        let event = self.ctx.new_event(None).map_err(map_driver_err)?;
        Ok(DeviceEvent::cuda(event))
    }

    pub(crate) fn alloc<T: DeviceValue>(&self, len: usize) -> DeviceResult<DeviceBuffer<T>> {
        let byte_len = (len * std::mem::size_of::<T>()).max(1);
        let bytes = self
            .alloc_stream
            .alloc_zeros::<u8>(byte_len)
            .map_err(map_driver_err)?;
        Ok(DeviceBuffer::cuda(bytes, len))
    }

    pub(crate) fn upload<T: DeviceValue>(
        &self,
        stream: &Arc<CudaStream>,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        data: &[T],
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        let started = Instant::now();
        let elem = std::mem::size_of::<T>();
        let mut bytes = lock(buffer.cuda_storage()?);
        let mut view = bytes.slice_mut(offset * elem..(offset + data.len()) * elem);
        stream
            .memcpy_htod(as_bytes(data), &mut view)
            .map_err(map_driver_err)?;
        if let Some(slot) = timing {
            slot.record(elapsed_ms(started));
        }
        Ok(())
    }

    pub(crate) fn download<T: DeviceValue>(
        &self,
        stream: &Arc<CudaStream>,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        count: usize,
        staging: &StagingBuffer<T>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        let started = Instant::now();
        let elem = std::mem::size_of::<T>();
        let bytes = lock(buffer.cuda_storage()?);
        let view = bytes.slice(offset * elem..(offset + count) * elem);
        let staging = staging.shared();
        let mut landed = lock(&staging);
        stream
            .memcpy_dtoh(&view, as_bytes_mut(&mut landed[..count]))
            .map_err(map_driver_err)?;
        if let Some(slot) = timing {
            slot.record(elapsed_ms(started));
        }
        Ok(())
    }

    pub(crate) fn clear<T: DeviceValue>(
        &self,
        stream: &Arc<CudaStream>,
        buffer: &DeviceBuffer<T>,
        count: usize,
    ) -> DeviceResult<()> {
        let elem = std::mem::size_of::<T>();
        let mut bytes = lock(buffer.cuda_storage()?);
        let mut view = bytes.slice_mut(0..count * elem);
        stream.memset_zeros(&mut view).map_err(map_driver_err)
    }

    pub(crate) fn launch_force_kernel(
        &self,
        stream: &Arc<CudaStream>,
        args: &ForceKernelArgs<'_>,
        uses_lj_comb: bool,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        let started = Instant::now();
        let cfg = launch_config(&force_kernel_launch_config(args.num_sci, uses_lj_comb));
        let func = match (args.flags.calc_energies, args.flags.prune) {
            (false, false) => &self.kernels.force,
            (true, false) => &self.kernels.force_energy,
            (false, true) => &self.kernels.force_prune,
            (true, true) => &self.kernels.force_energy_prune,
        };
        let consts = DevKernelConsts::from(&args.consts);
        let calc_fshift = args.flags.calc_shift_forces as i32;
        let xq = lock(args.xq.cuda_storage()?);
        let mut f = lock(args.f.cuda_storage()?);
        let mut fshift = lock(args.fshift.cuda_storage()?);
        let mut e_lj = lock(args.e_lj.cuda_storage()?);
        let mut e_el = lock(args.e_el.cuda_storage()?);
        let sci = lock(args.sci.cuda_storage()?);
        let mut cj4 = lock(args.cj4.cuda_storage()?);
        let excl = lock(args.excl.cuda_storage()?);
        let atom_types = lock(args.atom_types.cuda_storage()?);
        let lj_comb = lock(args.lj_comb.cuda_storage()?);
        let shift_vec = lock(args.shift_vec.cuda_storage()?);
        let nbfp = lock(args.nbfp.cuda_storage()?);
        let nbfp_comb = lock(args.nbfp_comb.cuda_storage()?);
        let coulomb_tab = lock(args.coulomb_tab.cuda_storage()?);
        unsafe {
            let mut builder = stream.launch_builder(func);
            builder.arg(&*xq);
            builder.arg(&mut *f);
            builder.arg(&mut *e_lj);
            builder.arg(&mut *e_el);
            builder.arg(&mut *fshift);
            builder.arg(&*atom_types);
            builder.arg(&*lj_comb);
            builder.arg(&*shift_vec);
            builder.arg(&*nbfp);
            builder.arg(&*nbfp_comb);
            builder.arg(&*coulomb_tab);
            builder.arg(&*sci);
            builder.arg(&mut *cj4);
            builder.arg(&*excl);
            builder.arg(&consts);
            builder.arg(&calc_fshift);
            builder.launch(cfg).map_err(map_driver_err)?;
        }
        if let Some(slot) = timing {
            slot.record(elapsed_ms(started));
        }
        Ok(())
    }

    pub(crate) fn launch_prune_kernel(
        &self,
        stream: &Arc<CudaStream>,
        args: &PruneKernelArgs<'_>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        let started = Instant::now();
        let remaining = args.num_sci.saturating_sub(args.part);
        if remaining == 0 {
            return Ok(());
        }
        let part_len = (remaining + args.num_parts - 1) / args.num_parts;
        let cfg = launch_config(&prune_kernel_launch_config(part_len));
        let func = if args.have_fresh_list {
            &self.kernels.prune_fresh
        } else {
            &self.kernels.prune_rolling
        };
        let consts = DevKernelConsts::from(&args.consts);
        let num_sci = args.num_sci as i32;
        let num_parts = args.num_parts as i32;
        let part = args.part as i32;
        let xq = lock(args.xq.cuda_storage()?);
        let sci = lock(args.sci.cuda_storage()?);
        let mut cj4 = lock(args.cj4.cuda_storage()?);
        let mut saved_imask = lock(args.saved_imask.cuda_storage()?);
        let shift_vec = lock(args.shift_vec.cuda_storage()?);
        unsafe {
            let mut builder = stream.launch_builder(func);
            builder.arg(&*xq);
            builder.arg(&*shift_vec);
            builder.arg(&*sci);
            builder.arg(&mut *cj4);
            builder.arg(&mut *saved_imask);
            builder.arg(&consts);
            builder.arg(&num_sci);
            builder.arg(&num_parts);
            builder.arg(&part);
            builder.launch(cfg).map_err(map_driver_err)?;
        }
        if let Some(slot) = timing {
            slot.record(elapsed_ms(started));
        }
        Ok(())
    }

    pub(crate) fn launch_gather_kernel(
        &self,
        stream: &Arc<CudaStream>,
        args: &GatherArgs<'_>,
        timing: Option<&TimingSlot>,
    ) -> DeviceResult<()> {
        let started = Instant::now();
        let block = 128u32;
        let cfg = LaunchConfig {
            grid_dim: (ceil_div(args.num_slots, block), 1, 1),
            block_dim: (block, 1, 1),
            shared_mem_bytes: 0,
        };
        let n_slots = args.num_slots as i32;
        let mut xq = lock(args.xq.cuda_storage()?);
        let x = lock(args.x.cuda_storage()?);
        let charges = lock(args.charges.cuda_storage()?);
        let atom_index = lock(args.atom_index.cuda_storage()?);
        unsafe {
            let mut builder = stream.launch_builder(&self.kernels.gather_x);
            builder.arg(&*x);
            builder.arg(&*charges);
            builder.arg(&*atom_index);
            builder.arg(&n_slots);
            builder.arg(&mut *xq);
            builder.launch(cfg).map_err(map_driver_err)?;
        }
        if let Some(slot) = timing {
            slot.record(elapsed_ms(started));
        }
        Ok(())
    }
}

fn launch_config(shape: &KernelLaunchConfig) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (shape.grid[0], shape.grid[1], shape.grid[2]),
        block_dim: (shape.block[0], shape.block[1], shape.block[2]),
        shared_mem_bytes: shape.shared_mem_bytes,
    }
}

fn ceil_div(value: usize, block: u32) -> u32 {
    if value == 0 {
        1
    } else {
        ((value as u32) + block - 1) / block
    }
}

fn as_bytes<T: Copy>(values: &[T]) -> &[u8] {
    // SAFETY:
    // - Every buffer element type is a `#[repr(C)]` aggregate of 4-byte
    //   scalars without padding.
    // - The returned slice borrows the same memory and covers exactly
    //   `size_of_val(values)` bytes.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
    }
}

fn as_bytes_mut<T: Copy>(values: &mut [T]) -> &mut [u8] {
    // SAFETY:
    // - Same layout argument as `as_bytes`.
    // - The mutable borrow is exclusive for the lifetime of the returned
    //   slice, and any byte pattern is a valid `u8`.
    unsafe {
        std::slice::from_raw_parts_mut(
            values.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(values),
        )
    }
}

pub(crate) fn map_driver_err(err: cudarc::driver::DriverError) -> DeviceError {
    DeviceError::Backend(format!("cuda driver error: {err}"))
}

fn map_compile_err(err: cudarc::nvrtc::CompileError) -> DeviceError {
    DeviceError::Backend(format!("cuda compile error: {err}"))
}
