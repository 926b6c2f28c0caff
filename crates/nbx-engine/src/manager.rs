//! Host-side management of the device-resident nonbonded state: parameter
//! and pair-list uploads, the per-step launch choreography across the local
//! and non-local streams, and result collection.
//!
//! With a domain decomposition the two streams are ordered through two
//! events: the non-local stream starts its work only after the local stream
//! has finished the shared uploads ("misc ops done"), and the local
//! copy-back waits until the non-local force transfer is staged ("non-local
//! done"). Both pairings are consumed once per step; skipped phases drain
//! or forget their marker so no token leaks into the next step.

use nbx_core::layout::{
    CLUSTER_SIZE, ENERGY_BUFFER_LEN, NUM_SHIFT_VECTORS, SHIFT_BUFFER_LEN,
};
use nbx_core::params::{pick_elec_kind, pick_vdw_kind};
use nbx_core::{
    build_coulomb_force_table, pick_kernel_setup, Cj4Entry, EnvOverrides, ExclEntry, Float2,
    Float3, Float4, ForceKernelFlags, InteractionConstants, InteractionSettings, KernelConsts,
    KernelSetup, LjCombinationRule, NonbondedParamsHost, PairListHost, PairlistParams, SciEntry,
};
use nbx_gpu::{
    DeviceBuffer, DeviceContext, DeviceEvent, DeviceSpec, DeviceStream, ForceKernelArgs,
    GatherArgs, PruneKernelArgs, StagingBuffer,
};

use crate::error::{EngineError, EngineResult};
use crate::timings::{GpuTimings, TimingState};
use crate::workload::{AtomLocality, InteractionLocality, StepWorkload};

/// Host-side per-atom inputs as re-packed by the grid layer: padded slot
/// counts and the per-slot type or combination-parameter data the selected
/// kernel flavor reads.
#[derive(Clone, Debug, Default)]
pub struct AtomDataHost {
    /// Packed slots covering the home domain.
    pub num_local_slots: usize,
    /// All packed slots, home and halo.
    pub num_total_slots: usize,
    /// Per-slot LJ type indices; read by the flavors that look pairs up in
    /// the type table.
    pub atom_types: Vec<i32>,
    /// Per-slot (sigma, epsilon); read by the combination-rule flavors.
    pub lj_comb: Vec<Float2>,
}

/// Collected outputs of one locality's step. `forces` covers the packed
/// slots of the requested atom range; `fshift` holds one vector per
/// periodic shift and is empty unless the step computed the virial, as are
/// the energies unless it computed them. Non-local collection only ever
/// carries forces.
#[derive(Clone, Debug, Default)]
pub struct StepOutputs {
    pub forces: Vec<Float3>,
    pub fshift: Vec<Float3>,
    pub e_lj: f32,
    pub e_elec: f32,
}

struct DevicePairlist {
    sci: DeviceBuffer<SciEntry>,
    cj4: DeviceBuffer<Cj4Entry>,
    excl: DeviceBuffer<ExclEntry>,
    /// Masks as built, kept so rolling prune passes always start from the
    /// unpruned state; sized with `cj4`.
    saved_imask: DeviceBuffer<u32>,
    num_sci: usize,
    have_fresh_list: bool,
    /// Parts a rolling prune cycle splits the list into; 0 until a pass
    /// records the cadence.
    rolling_num_parts: usize,
    rolling_part: usize,
}

impl DevicePairlist {
    fn empty(context: &DeviceContext) -> EngineResult<Self> {
        Ok(Self {
            sci: context.alloc(0)?,
            cj4: context.alloc(0)?,
            excl: context.alloc(0)?,
            saved_imask: context.alloc(0)?,
            num_sci: 0,
            have_fresh_list: false,
            rolling_num_parts: 0,
            rolling_part: 0,
        })
    }
}

struct AtomBuffers {
    xq: DeviceBuffer<Float4>,
    f: DeviceBuffer<Float3>,
    atom_types: DeviceBuffer<i32>,
    lj_comb: DeviceBuffer<Float2>,
    num_local: usize,
    num_all: usize,
}

struct OutputBuffers {
    fshift: DeviceBuffer<Float3>,
    e_lj: DeviceBuffer<f32>,
    e_el: DeviceBuffer<f32>,
}

struct ParamTables {
    nbfp: DeviceBuffer<Float2>,
    nbfp_comb: DeviceBuffer<Float2>,
    coulomb_tab: DeviceBuffer<f32>,
    ntypes: usize,
    comb_rule: LjCombinationRule,
    ljpme_comb_rule: LjCombinationRule,
}

struct ConversionState {
    x: DeviceBuffer<Float3>,
    charges: DeviceBuffer<f32>,
    atom_index: DeviceBuffer<i32>,
    num_slots: usize,
    num_source_atoms: usize,
}

struct StagingAreas {
    f_local: StagingBuffer<Float3>,
    f_nonlocal: StagingBuffer<Float3>,
    fshift: StagingBuffer<Float3>,
    e_lj: StagingBuffer<f32>,
    e_el: StagingBuffer<f32>,
}

impl StagingAreas {
    fn new() -> Self {
        Self {
            f_local: StagingBuffer::new(0),
            f_nonlocal: StagingBuffer::new(0),
            fshift: StagingBuffer::new(SHIFT_BUFFER_LEN),
            e_lj: StagingBuffer::new(ENERGY_BUFFER_LEN),
            e_el: StagingBuffer::new(ENERGY_BUFFER_LEN),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct WorkFlags {
    collaborator: bool,
    cached: bool,
}

struct PerLocality<T> {
    local: T,
    nonlocal: T,
}

impl<T> PerLocality<T> {
    fn get(&self, locality: InteractionLocality) -> &T {
        match locality {
            InteractionLocality::Local => &self.local,
            InteractionLocality::NonLocal => &self.nonlocal,
        }
    }

    fn get_mut(&mut self, locality: InteractionLocality) -> &mut T {
        match locality {
            InteractionLocality::Local => &mut self.local,
            InteractionLocality::NonLocal => &mut self.nonlocal,
        }
    }
}

fn stream_for<'a>(
    local: &'a Option<DeviceStream>,
    nonlocal: &'a Option<DeviceStream>,
    locality: InteractionLocality,
) -> EngineResult<&'a DeviceStream> {
    let stream = match locality {
        InteractionLocality::Local => local.as_ref(),
        InteractionLocality::NonLocal => nonlocal.as_ref(),
    };
    stream.ok_or_else(|| match locality {
        InteractionLocality::Local => {
            EngineError::InvalidConfiguration("the engine was already freed".into())
        }
        InteractionLocality::NonLocal => EngineError::InvalidConfiguration(
            "no non-local stream; the engine was built without a non-local domain".into(),
        ),
    })
}

fn sum_energy_slots(slots: &[f32]) -> f32 {
    slots.iter().sum()
}

/// Folds the hashed per-shift accumulator regions into one vector per
/// periodic shift.
fn sum_shift_slots(slots: &[Float3]) -> Vec<Float3> {
    let mut folded = vec![Float3::zero(); NUM_SHIFT_VECTORS];
    for (index, value) in slots.iter().enumerate() {
        let shift = index % NUM_SHIFT_VECTORS;
        folded[shift] = folded[shift].add(*value);
    }
    folded
}

/// Device-resident nonbonded state and the operations one MD step drives
/// it with.
pub struct NonbondedGpu {
    context: DeviceContext,
    consts: KernelConsts,
    list_params: PairlistParams,
    params: ParamTables,
    atoms: AtomBuffers,
    outputs: OutputBuffers,
    lists: PerLocality<DevicePairlist>,
    work: PerLocality<WorkFlags>,
    local_stream: Option<DeviceStream>,
    nonlocal_stream: Option<DeviceStream>,
    misc_ops_done: DeviceEvent,
    nonlocal_done: DeviceEvent,
    nonlocal_done_marked: bool,
    shift_vec: DeviceBuffer<Float3>,
    shift_vec_uploaded: bool,
    staging: StagingAreas,
    conversion: Option<ConversionState>,
    timing: TimingState,
    freed: bool,
}

impl std::fmt::Debug for NonbondedGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonbondedGpu").finish_non_exhaustive()
    }
}

impl NonbondedGpu {
    /// Builds the device state for one simulation: selects the kernel
    /// flavors from the interaction settings and the environment overrides,
    /// compiles or installs the kernels, creates one stream per active
    /// locality plus the two cross-stream events, and uploads the per-type
    /// parameter tables. Fails fast on interaction combinations without a
    /// kernel flavor and on conflicting overrides.
    pub fn new(
        spec: DeviceSpec,
        settings: &InteractionSettings,
        list_params: PairlistParams,
        host_params: &NonbondedParamsHost,
        have_nonlocal_domain: bool,
    ) -> EngineResult<Self> {
        if host_params.ntypes == 0 {
            return Err(EngineError::InvalidConfiguration(
                "at least one atom type is required".into(),
            ));
        }
        if !(list_params.rlist_inner > 0.0) || list_params.rlist_outer < list_params.rlist_inner {
            return Err(EngineError::InvalidConfiguration(format!(
                "list radii must satisfy 0 < inner <= outer, got {} and {}",
                list_params.rlist_inner, list_params.rlist_outer
            )));
        }
        let ic = InteractionConstants::from_settings(settings)?;
        if ic.r_coulomb.max(ic.r_vdw) > list_params.rlist_inner {
            return Err(EngineError::InvalidConfiguration(format!(
                "interaction cut-off {} exceeds the inner list radius {}",
                ic.r_coulomb.max(ic.r_vdw),
                list_params.rlist_inner
            )));
        }
        let overrides = EnvOverrides::from_env();
        let setup = pick_kernel_setup(&ic, host_params, &overrides)?;
        let context = DeviceContext::new(spec, setup)?;
        let local_stream = context.new_stream("local")?;
        let nonlocal_stream = if have_nonlocal_domain {
            Some(context.new_stream("nonlocal")?)
        } else {
            None
        };
        let misc_ops_done = context.new_event()?;
        let nonlocal_done = context.new_event()?;

        let nbfp = if setup.vdw.uses_lj_comb() {
            context.alloc(0)?
        } else {
            let buffer = context.alloc(host_params.nbfp.len())?;
            context.upload(&local_stream, &buffer, 0, &host_params.nbfp, None)?;
            buffer
        };
        let nbfp_comb = if setup.vdw.is_lj_ewald() {
            if host_params.nbfp_comb.len() != host_params.ntypes {
                return Err(EngineError::Mismatch(format!(
                    "lj-pme kernels need {} per-type combination entries, got {}",
                    host_params.ntypes,
                    host_params.nbfp_comb.len()
                )));
            }
            let buffer = context.alloc(host_params.nbfp_comb.len())?;
            context.upload(&local_stream, &buffer, 0, &host_params.nbfp_comb, None)?;
            buffer
        } else {
            context.alloc(0)?
        };
        let (coulomb_tab, coulomb_tab_scale) = if setup.elec.is_tabulated() {
            let table = build_coulomb_force_table(ic.ewald_beta, ic.r_coulomb)?;
            let buffer = context.alloc(table.data.len())?;
            context.upload(&local_stream, &buffer, 0, &table.data, None)?;
            (buffer, table.scale)
        } else {
            (context.alloc(0)?, 0.0)
        };
        let consts = KernelConsts::new(&ic, host_params.ntypes, &list_params, coulomb_tab_scale);

        let outputs = OutputBuffers {
            fshift: context.alloc(SHIFT_BUFFER_LEN)?,
            e_lj: context.alloc(ENERGY_BUFFER_LEN)?,
            e_el: context.alloc(ENERGY_BUFFER_LEN)?,
        };
        let atoms = AtomBuffers {
            xq: context.alloc(0)?,
            f: context.alloc(0)?,
            atom_types: context.alloc(0)?,
            lj_comb: context.alloc(0)?,
            num_local: 0,
            num_all: 0,
        };
        let shift_vec = context.alloc(NUM_SHIFT_VECTORS)?;
        let lists = PerLocality {
            local: DevicePairlist::empty(&context)?,
            nonlocal: DevicePairlist::empty(&context)?,
        };

        log::debug!(
            "nonbonded engine on {} backend, {:?}/{:?} kernels, non-local domain {}",
            context.backend_name(),
            setup.elec,
            setup.vdw,
            if have_nonlocal_domain { "on" } else { "off" }
        );

        Ok(Self {
            context,
            consts,
            list_params,
            params: ParamTables {
                nbfp,
                nbfp_comb,
                coulomb_tab,
                ntypes: host_params.ntypes,
                comb_rule: host_params.comb_rule,
                ljpme_comb_rule: host_params.ljpme_comb_rule,
            },
            atoms,
            outputs,
            lists,
            work: PerLocality {
                local: WorkFlags::default(),
                nonlocal: WorkFlags::default(),
            },
            local_stream: Some(local_stream),
            nonlocal_stream,
            misc_ops_done,
            nonlocal_done,
            nonlocal_done_marked: false,
            shift_vec,
            shift_vec_uploaded: false,
            staging: StagingAreas::new(),
            conversion: None,
            timing: TimingState::from_env(),
            freed: false,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.context.backend_name()
    }

    pub fn kernel_setup(&self) -> KernelSetup {
        self.context.setup()
    }

    pub fn have_nonlocal_domain(&self) -> bool {
        self.nonlocal_stream.is_some()
    }

    pub fn timing_enabled(&self) -> bool {
        self.timing.enabled()
    }

    /// Cached short-range work flag of one locality.
    pub fn has_work(&self, locality: InteractionLocality) -> bool {
        self.work.get(locality).cached
    }

    /// Refreshes the work flag: a locality has short-range work when its
    /// pair list is non-empty or a collaborator (listed forces on the same
    /// stream) reported interactions.
    pub fn setup_short_range_work(
        &mut self,
        locality: InteractionLocality,
        collaborator_has_interactions: bool,
    ) {
        let num_sci = self.lists.get(locality).num_sci;
        let work = self.work.get_mut(locality);
        work.collaborator = collaborator_has_interactions;
        work.cached = num_sci > 0 || collaborator_has_interactions;
    }

    /// Applies updated interaction settings: rewrites the scalar constant
    /// block and rebuilds the Ewald correction table. Pair lists and atom
    /// buffers are untouched. The settings must keep selecting the kernel
    /// flavors the engine was built with.
    pub fn update_interaction_constants(
        &mut self,
        settings: &InteractionSettings,
    ) -> EngineResult<()> {
        let ic = InteractionConstants::from_settings(settings)?;
        let overrides = EnvOverrides::from_env();
        let elec = pick_elec_kind(&ic, &overrides)?;
        let vdw = pick_vdw_kind(&ic, self.params.comb_rule, self.params.ljpme_comb_rule)?;
        let setup = self.context.setup();
        if elec != setup.elec || vdw != setup.vdw {
            return Err(EngineError::UnsupportedVariant(format!(
                "updated settings select {:?}/{:?} kernels but the engine was built \
                 for {:?}/{:?}; rebuild the engine to switch flavors",
                elec, vdw, setup.elec, setup.vdw
            )));
        }
        if ic.r_coulomb.max(ic.r_vdw) > self.list_params.rlist_inner {
            return Err(EngineError::InvalidConfiguration(format!(
                "updated cut-off {} exceeds the inner list radius {}",
                ic.r_coulomb.max(ic.r_vdw),
                self.list_params.rlist_inner
            )));
        }
        let coulomb_tab_scale = if setup.elec.is_tabulated() {
            let table = build_coulomb_force_table(ic.ewald_beta, ic.r_coulomb)?;
            let buffer = self.context.alloc(table.data.len())?;
            let stream = stream_for(
                &self.local_stream,
                &self.nonlocal_stream,
                InteractionLocality::Local,
            )?;
            self.context.upload(stream, &buffer, 0, &table.data, None)?;
            self.params.coulomb_tab = buffer;
            table.scale
        } else {
            0.0
        };
        self.consts =
            KernelConsts::new(&ic, self.params.ntypes, &self.list_params, coulomb_tab_scale);
        log::debug!("interaction constants updated, ewald beta {}", ic.ewald_beta);
        Ok(())
    }

    /// Uploads the periodic shift vectors. Cached after the first upload
    /// unless the box is dynamic.
    pub fn upload_shift_vectors(
        &mut self,
        shift_vec: &[Float3],
        dynamic_box: bool,
    ) -> EngineResult<()> {
        if shift_vec.len() != NUM_SHIFT_VECTORS {
            return Err(EngineError::Mismatch(format!(
                "expected {} shift vectors, got {}",
                NUM_SHIFT_VECTORS,
                shift_vec.len()
            )));
        }
        if self.shift_vec_uploaded && !dynamic_box {
            return Ok(());
        }
        let stream = stream_for(
            &self.local_stream,
            &self.nonlocal_stream,
            InteractionLocality::Local,
        )?;
        self.context.upload(stream, &self.shift_vec, 0, shift_vec, None)?;
        self.shift_vec_uploaded = true;
        Ok(())
    }

    /// Installs per-atom data for the current partitioning: grows `xq`, the
    /// force buffer and the type or combination array only when the slot
    /// count exceeds their capacity, zero-fills the force buffer after a
    /// reallocation, and uploads the per-slot data the kernel flavor reads.
    pub fn init_atom_data(&mut self, atoms: &AtomDataHost) -> EngineResult<()> {
        if atoms.num_local_slots > atoms.num_total_slots {
            return Err(EngineError::Mismatch(format!(
                "local slot count {} exceeds total {}",
                atoms.num_local_slots, atoms.num_total_slots
            )));
        }
        let total = atoms.num_total_slots;
        let uses_comb = self.context.setup().vdw.uses_lj_comb();
        if uses_comb {
            if atoms.lj_comb.len() != total {
                return Err(EngineError::Mismatch(format!(
                    "combination parameters cover {} slots, atom data has {}",
                    atoms.lj_comb.len(),
                    total
                )));
            }
        } else if atoms.atom_types.len() != total {
            return Err(EngineError::Mismatch(format!(
                "type indices cover {} slots, atom data has {}",
                atoms.atom_types.len(),
                total
            )));
        }
        let stream = stream_for(
            &self.local_stream,
            &self.nonlocal_stream,
            InteractionLocality::Local,
        )?;
        self.context.reserve(&mut self.atoms.xq, total)?;
        let force_grew = self.context.reserve(&mut self.atoms.f, total)?;
        if force_grew {
            // Forces accumulate in place, so fresh storage must start from
            // zero before the first launch touches it.
            self.context.clear(stream, &self.atoms.f, total)?;
        }
        if uses_comb {
            self.context.reserve(&mut self.atoms.lj_comb, total)?;
            self.context
                .upload(stream, &self.atoms.lj_comb, 0, &atoms.lj_comb, None)?;
        } else {
            self.context.reserve(&mut self.atoms.atom_types, total)?;
            self.context
                .upload(stream, &self.atoms.atom_types, 0, &atoms.atom_types, None)?;
        }
        self.atoms.num_local = atoms.num_local_slots;
        self.atoms.num_all = total;
        self.staging.f_local = StagingBuffer::new(atoms.num_local_slots);
        self.staging.f_nonlocal = StagingBuffer::new(total - atoms.num_local_slots);
        Ok(())
    }

    /// Uploads a freshly built pair list for one locality, growing the
    /// device arrays with headroom, and arms the pruning state: the list is
    /// fresh and any rolling cadence starts over.
    pub fn init_pairlist(
        &mut self,
        list: &PairListHost,
        locality: InteractionLocality,
    ) -> EngineResult<()> {
        if list.atoms_per_cluster != CLUSTER_SIZE {
            return Err(EngineError::ClusterSizeMismatch {
                list: list.atoms_per_cluster,
                kernel: CLUSTER_SIZE,
            });
        }
        list.validate()?;
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, locality)?;
        let timing = self.timing.pairlist_h2d(locality);
        let device_list = self.lists.get_mut(locality);
        self.context.reserve(&mut device_list.sci, list.sci.len())?;
        self.context.reserve(&mut device_list.cj4, list.cj4.len())?;
        self.context.reserve(&mut device_list.excl, list.excl.len())?;
        self.context
            .reserve(&mut device_list.saved_imask, list.cj4.len())?;
        self.context
            .upload(stream, &device_list.sci, 0, &list.sci, timing)?;
        self.context
            .upload(stream, &device_list.cj4, 0, &list.cj4, timing)?;
        self.context
            .upload(stream, &device_list.excl, 0, &list.excl, timing)?;
        device_list.num_sci = list.sci.len();
        device_list.have_fresh_list = true;
        device_list.rolling_num_parts = 0;
        device_list.rolling_part = 0;
        let num_sci = device_list.num_sci;
        let work = self.work.get_mut(locality);
        work.cached = num_sci > 0 || work.collaborator;
        Ok(())
    }

    /// Installs the gather path: the slot-to-source mapping of the packed
    /// layout (negative entries are filler slots) and the source charges.
    /// Requires atom data, whose slot count the mapping must cover.
    pub fn init_coordinate_conversion(
        &mut self,
        atom_index: &[i32],
        charges: &[f32],
    ) -> EngineResult<()> {
        if atom_index.len() != self.atoms.num_all {
            return Err(EngineError::Mismatch(format!(
                "slot mapping covers {} slots, atom data holds {}",
                atom_index.len(),
                self.atoms.num_all
            )));
        }
        for &source in atom_index {
            if source >= 0 && source as usize >= charges.len() {
                return Err(EngineError::Mismatch(format!(
                    "slot maps to atom {} beyond {} source atoms",
                    source,
                    charges.len()
                )));
            }
        }
        let stream = stream_for(
            &self.local_stream,
            &self.nonlocal_stream,
            InteractionLocality::Local,
        )?;
        let x = self.context.alloc(charges.len())?;
        let charge_buffer = self.context.alloc(charges.len())?;
        self.context.upload(stream, &charge_buffer, 0, charges, None)?;
        let index_buffer = self.context.alloc(atom_index.len())?;
        self.context.upload(stream, &index_buffer, 0, atom_index, None)?;
        self.conversion = Some(ConversionState {
            x,
            charges: charge_buffer,
            atom_index: index_buffer,
            num_slots: atom_index.len(),
            num_source_atoms: charges.len(),
        });
        Ok(())
    }

    /// Zeroes the force buffer, and the shift-force and energy accumulators
    /// when the step needs them.
    pub fn clear_outputs(&mut self, workload: &StepWorkload) -> EngineResult<()> {
        let stream = stream_for(
            &self.local_stream,
            &self.nonlocal_stream,
            InteractionLocality::Local,
        )?;
        self.context.clear(stream, &self.atoms.f, self.atoms.num_all)?;
        if workload.compute_virial || workload.compute_energies {
            self.context
                .clear(stream, &self.outputs.fshift, SHIFT_BUFFER_LEN)?;
            self.context
                .clear(stream, &self.outputs.e_lj, ENERGY_BUFFER_LEN)?;
            self.context
                .clear(stream, &self.outputs.e_el, ENERGY_BUFFER_LEN)?;
        }
        Ok(())
    }

    /// Uploads packed coordinates and charges for one atom range. `xq` is
    /// the full packed array; only the range's slots transfer. In two-stream
    /// mode the local upload marks the shared-upload event and the
    /// non-local upload waits on it first; an empty non-local domain issues
    /// nothing and drains the marker instead.
    pub fn copy_xq_to_device(
        &mut self,
        locality: AtomLocality,
        xq: &[Float4],
    ) -> EngineResult<()> {
        if xq.len() != self.atoms.num_all {
            return Err(EngineError::Mismatch(format!(
                "coordinate array covers {} slots, atom data holds {}",
                xq.len(),
                self.atoms.num_all
            )));
        }
        let interaction = locality.interaction_locality();
        if locality == AtomLocality::NonLocal && !self.has_work(InteractionLocality::NonLocal) {
            let local = stream_for(
                &self.local_stream,
                &self.nonlocal_stream,
                InteractionLocality::Local,
            )?;
            self.misc_ops_done.reset(local)?;
            self.lists
                .get_mut(InteractionLocality::NonLocal)
                .have_fresh_list = false;
            return Ok(());
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, interaction)?;
        if interaction == InteractionLocality::NonLocal {
            self.misc_ops_done.wait_on(stream)?;
        }
        let (start, len) = self.atom_range(locality);
        let timing = self.timing.xq_h2d(interaction);
        self.context
            .upload(stream, &self.atoms.xq, start, &xq[start..start + len], timing)?;
        if interaction == InteractionLocality::Local && self.nonlocal_stream.is_some() {
            self.misc_ops_done.mark(stream)?;
        }
        Ok(())
    }

    /// Fills `xq` for one atom range by gathering device-resident positions
    /// through the slot mapping, pairing each position with its stored
    /// charge and parking filler slots far away with zero charge. Follows
    /// the same cross-stream ordering as [`Self::copy_xq_to_device`].
    pub fn convert_coordinates(
        &mut self,
        locality: AtomLocality,
        x: &[Float3],
    ) -> EngineResult<()> {
        let interaction = locality.interaction_locality();
        if locality == AtomLocality::NonLocal && !self.has_work(InteractionLocality::NonLocal) {
            let local = stream_for(
                &self.local_stream,
                &self.nonlocal_stream,
                InteractionLocality::Local,
            )?;
            self.misc_ops_done.reset(local)?;
            self.lists
                .get_mut(InteractionLocality::NonLocal)
                .have_fresh_list = false;
            return Ok(());
        }
        let conversion = self.conversion.as_ref().ok_or_else(|| {
            EngineError::InvalidConfiguration(
                "coordinate conversion was not initialized".into(),
            )
        })?;
        if x.len() != conversion.num_source_atoms {
            return Err(EngineError::Mismatch(format!(
                "position array holds {} atoms, conversion was set up for {}",
                x.len(),
                conversion.num_source_atoms
            )));
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, interaction)?;
        if interaction == InteractionLocality::NonLocal {
            self.misc_ops_done.wait_on(stream)?;
        }
        let timing = self.timing.xq_h2d(interaction);
        self.context.upload(stream, &conversion.x, 0, x, timing)?;
        let args = GatherArgs {
            x: &conversion.x,
            charges: &conversion.charges,
            atom_index: &conversion.atom_index,
            num_slots: conversion.num_slots,
            xq: &self.atoms.xq,
        };
        self.context.launch_gather_kernel(stream, &args, None)?;
        if interaction == InteractionLocality::Local && self.nonlocal_stream.is_some() {
            self.misc_ops_done.mark(stream)?;
        }
        Ok(())
    }

    /// Launches the force kernel for one locality. A fresh list either gets
    /// a first prune pass via the standalone kernel (dynamic pruning) or
    /// runs the pruning kernel variant, after which the list is no longer
    /// fresh. Skips entirely when the locality has no work.
    pub fn launch_force_kernel(
        &mut self,
        locality: InteractionLocality,
        workload: &StepWorkload,
    ) -> EngineResult<()> {
        if !self.has_work(locality) {
            return Ok(());
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, locality)?;
        let list = self.lists.get_mut(locality);
        let mut flags = ForceKernelFlags {
            calc_energies: workload.compute_energies,
            calc_shift_forces: workload.compute_virial,
            prune: false,
        };
        if list.have_fresh_list {
            if self.list_params.use_dynamic_pruning {
                // First pass over a fresh list covers every entry; the
                // rolling cadence is recorded by later prune calls.
                let args = PruneKernelArgs {
                    xq: &self.atoms.xq,
                    shift_vec: &self.shift_vec,
                    sci: &list.sci,
                    cj4: &list.cj4,
                    saved_imask: &list.saved_imask,
                    num_sci: list.num_sci,
                    consts: self.consts,
                    have_fresh_list: true,
                    num_parts: 1,
                    part: 0,
                };
                self.context
                    .launch_prune_kernel(stream, &args, self.timing.prune_kernel(locality))?;
            } else {
                flags.prune = true;
            }
            list.have_fresh_list = false;
        }
        let args = ForceKernelArgs {
            xq: &self.atoms.xq,
            f: &self.atoms.f,
            fshift: &self.outputs.fshift,
            e_lj: &self.outputs.e_lj,
            e_el: &self.outputs.e_el,
            sci: &list.sci,
            cj4: &list.cj4,
            excl: &list.excl,
            atom_types: &self.atoms.atom_types,
            lj_comb: &self.atoms.lj_comb,
            shift_vec: &self.shift_vec,
            nbfp: &self.params.nbfp,
            nbfp_comb: &self.params.nbfp_comb,
            coulomb_tab: &self.params.coulomb_tab,
            num_sci: list.num_sci,
            consts: self.consts,
            flags,
        };
        self.context
            .launch_force_kernel(stream, &args, self.timing.force_kernel(locality))
            .map_err(EngineError::from)
    }

    /// Launches a prune pass for one locality. On a fresh list the pass
    /// covers every entry, prunes to the outer list radius and records
    /// `num_parts` as the rolling cadence; afterwards each call prunes one
    /// interleaved part to the inner radius and advances the part counter.
    /// The cadence cannot change until the next list rebuild.
    pub fn launch_prune_kernel(
        &mut self,
        locality: InteractionLocality,
        num_parts: usize,
    ) -> EngineResult<()> {
        if num_parts == 0 {
            return Err(EngineError::InvalidConfiguration(
                "a prune pass needs at least one part".into(),
            ));
        }
        if !self.has_work(locality) {
            return Ok(());
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, locality)?;
        let list = self.lists.get_mut(locality);
        let (fresh, launch_num_parts, part) = if list.have_fresh_list {
            list.rolling_num_parts = num_parts;
            list.rolling_part = 0;
            (true, 1, 0)
        } else {
            if list.rolling_num_parts == 0 {
                list.rolling_num_parts = num_parts;
            } else if num_parts != list.rolling_num_parts {
                return Err(EngineError::InvalidConfiguration(format!(
                    "prune part count changed from {} to {} between list rebuilds",
                    list.rolling_num_parts, num_parts
                )));
            }
            let part = list.rolling_part;
            list.rolling_part = (part + 1) % list.rolling_num_parts;
            (false, list.rolling_num_parts, part)
        };
        let args = PruneKernelArgs {
            xq: &self.atoms.xq,
            shift_vec: &self.shift_vec,
            sci: &list.sci,
            cj4: &list.cj4,
            saved_imask: &list.saved_imask,
            num_sci: list.num_sci,
            consts: self.consts,
            have_fresh_list: fresh,
            num_parts: launch_num_parts,
            part,
        };
        self.context
            .launch_prune_kernel(stream, &args, self.timing.prune_kernel(locality))?;
        if fresh {
            list.have_fresh_list = false;
        }
        Ok(())
    }

    /// Stages the device-to-host transfers of one locality's results. The
    /// non-local pass marks the "non-local done" event after its force
    /// transfer; the local pass first waits on that mark when one is
    /// outstanding. Force transfer is skipped when the step keeps forces on
    /// the device; shift forces and energies ride the local pass only. A
    /// locality without work issues nothing and forgets its marker.
    pub fn launch_copy_back(
        &mut self,
        locality: AtomLocality,
        workload: &StepWorkload,
    ) -> EngineResult<()> {
        let interaction = locality.interaction_locality();
        if !self.has_work(interaction) {
            if interaction == InteractionLocality::NonLocal {
                self.nonlocal_done_marked = false;
            }
            return Ok(());
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, interaction)?;
        if interaction == InteractionLocality::Local && self.nonlocal_done_marked {
            self.nonlocal_done.wait_on(stream)?;
            self.nonlocal_done_marked = false;
        }
        if !workload.use_gpu_f_buffer_ops {
            let (start, len) = self.atom_range(locality);
            let staging = match locality {
                AtomLocality::NonLocal => &self.staging.f_nonlocal,
                _ => &self.staging.f_local,
            };
            self.context.download(
                stream,
                &self.atoms.f,
                start,
                len,
                staging,
                self.timing.f_d2h(interaction),
            )?;
        }
        if interaction == InteractionLocality::NonLocal {
            self.nonlocal_done.mark(stream)?;
            self.nonlocal_done_marked = true;
            return Ok(());
        }
        if workload.compute_virial {
            self.context.download(
                stream,
                &self.outputs.fshift,
                0,
                SHIFT_BUFFER_LEN,
                &self.staging.fshift,
                None,
            )?;
        }
        if workload.compute_energies {
            self.context.download(
                stream,
                &self.outputs.e_lj,
                0,
                ENERGY_BUFFER_LEN,
                &self.staging.e_lj,
                None,
            )?;
            self.context.download(
                stream,
                &self.outputs.e_el,
                0,
                ENERGY_BUFFER_LEN,
                &self.staging.e_el,
                None,
            )?;
        }
        Ok(())
    }

    /// Blocks until the locality's stream has drained, then folds the
    /// hashed accumulator regions into the returned totals. Shift forces
    /// and energies only materialize on the local pass; a locality without
    /// work returns empty outputs.
    pub fn wait_and_collect(
        &self,
        locality: AtomLocality,
        workload: &StepWorkload,
    ) -> EngineResult<StepOutputs> {
        let interaction = locality.interaction_locality();
        if !self.has_work(interaction) {
            return Ok(StepOutputs::default());
        }
        let stream = stream_for(&self.local_stream, &self.nonlocal_stream, interaction)?;
        stream.synchronize()?;
        let mut outputs = StepOutputs::default();
        if !workload.use_gpu_f_buffer_ops {
            let staging = match locality {
                AtomLocality::NonLocal => &self.staging.f_nonlocal,
                _ => &self.staging.f_local,
            };
            outputs.forces = staging.with(|forces| forces.to_vec());
        }
        if interaction == InteractionLocality::Local {
            if workload.compute_virial {
                outputs.fshift = self.staging.fshift.with(sum_shift_slots);
            }
            if workload.compute_energies {
                outputs.e_lj = self.staging.e_lj.with(sum_energy_slots);
                outputs.e_elec = self.staging.e_el.with(sum_energy_slots);
            }
        }
        Ok(outputs)
    }

    pub fn timings(&self) -> GpuTimings {
        self.timing.snapshot()
    }

    pub fn reset_timings(&mut self) {
        self.timing.reset();
    }

    /// Waits out in-flight work and joins the stream workers. Idempotent;
    /// buffers release when the engine drops.
    pub fn free(&mut self) -> EngineResult<()> {
        if self.freed {
            return Ok(());
        }
        if let Some(stream) = self.local_stream.take() {
            stream.synchronize()?;
        }
        if let Some(stream) = self.nonlocal_stream.take() {
            stream.synchronize()?;
        }
        self.freed = true;
        Ok(())
    }

    fn atom_range(&self, locality: AtomLocality) -> (usize, usize) {
        match locality {
            AtomLocality::Local => (0, self.atoms.num_local),
            AtomLocality::NonLocal => {
                (self.atoms.num_local, self.atoms.num_all - self.atoms.num_local)
            }
            AtomLocality::All => (0, self.atoms.num_all),
        }
    }
}

impl Drop for NonbondedGpu {
    fn drop(&mut self) {
        // Joining the workers first keeps teardown ordered behind in-flight
        // jobs.
        let _ = self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_slot_folding_sums_all_regions() {
        let mut slots = vec![Float3::zero(); SHIFT_BUFFER_LEN];
        // Shift 7 in region 0 and in the last region.
        slots[7] = Float3::new(1.0, 0.0, 0.0);
        slots[SHIFT_BUFFER_LEN - NUM_SHIFT_VECTORS + 7] = Float3::new(0.5, 0.0, 0.0);
        let folded = sum_shift_slots(&slots);
        assert_eq!(folded.len(), NUM_SHIFT_VECTORS);
        assert!((folded[7].x - 1.5).abs() < 1e-6);
        assert_eq!(folded[8], Float3::zero());
    }

    #[test]
    fn energy_slot_folding_sums_all_regions() {
        let mut slots = vec![0.0_f32; ENERGY_BUFFER_LEN];
        slots[0] = 0.25;
        slots[ENERGY_BUFFER_LEN - 1] = 0.75;
        assert!((sum_energy_slots(&slots) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn atom_localities_map_to_their_streams() {
        assert_eq!(
            AtomLocality::Local.interaction_locality(),
            InteractionLocality::Local
        );
        assert_eq!(
            AtomLocality::All.interaction_locality(),
            InteractionLocality::Local
        );
        assert_eq!(
            AtomLocality::NonLocal.interaction_locality(),
            InteractionLocality::NonLocal
        );
    }
}
