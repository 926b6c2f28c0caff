//! Reference implementation of the cluster-pair force and prune kernels.
//!
//! The functions here execute one lane group at a time but keep the lane
//! structure explicit: per-lane registers live in `LANE_GROUP_SIZE`-wide
//! arrays and collective steps go through the primitives in [`reduce`],
//! so a device port maps each loop body onto one hardware lane unchanged.

pub mod force;
pub mod models;
pub mod prune;
pub mod reduce;

pub use force::force_kernel;
pub use prune::prune_kernel;

use crate::params::{
    ElecKind, InteractionConstants, KernelSetup, PotSwitchConstants, SwitchConstants, VdwKind,
};
use crate::pairlist::{Cj4Entry, ExclEntry, PairlistParams, SciEntry};
use crate::vec::{Float2, Float3, Float4};

use models::{
    ElecCutoff, ElecReactionField, EwaldAnalytical, EwaldTabulated, LjCombGeom, LjCombLB,
    LjCutoff, LjEwaldCombGeom, LjEwaldCombLB, LjForceSwitch, LjPotSwitch,
};

/// Scalar constants passed to every kernel invocation; the flattened image
/// of [`InteractionConstants`] plus list radii and derived coefficients.
#[derive(Clone, Copy, Debug)]
pub struct KernelConsts {
    pub ntypes: usize,
    pub epsfac: f32,
    pub c_rf: f32,
    pub two_k_rf: f32,
    pub ewald_beta: f32,
    pub sh_ewald: f32,
    pub sh_lj_ewald: f32,
    /// Squared LJ-PME splitting coefficient and its sixth power over six.
    pub lje_coeff2: f32,
    pub lje_coeff6_6: f32,
    pub coulomb_tab_scale: f32,
    pub rcoulomb_sq: f32,
    pub rvdw_sq: f32,
    pub rvdw_switch: f32,
    pub rlist_outer_sq: f32,
    pub rlist_inner_sq: f32,
    pub dispersion_shift: SwitchConstants,
    pub repulsion_shift: SwitchConstants,
    pub vdw_switch: PotSwitchConstants,
}

impl KernelConsts {
    pub fn new(
        ic: &InteractionConstants,
        ntypes: usize,
        list_params: &PairlistParams,
        coulomb_tab_scale: f32,
    ) -> Self {
        let lje_coeff2 = ic.ewaldcoeff_lj * ic.ewaldcoeff_lj;
        Self {
            ntypes,
            epsfac: ic.epsfac,
            c_rf: ic.reaction_field_shift,
            two_k_rf: 2.0 * ic.reaction_field_coeff,
            ewald_beta: ic.ewald_beta,
            sh_ewald: ic.sh_ewald,
            sh_lj_ewald: ic.sh_lj_ewald,
            lje_coeff2,
            lje_coeff6_6: lje_coeff2 * lje_coeff2 * lje_coeff2 * (1.0 / 6.0),
            coulomb_tab_scale,
            rcoulomb_sq: ic.r_coulomb * ic.r_coulomb,
            rvdw_sq: ic.r_vdw * ic.r_vdw,
            rvdw_switch: ic.r_vdw_switch,
            rlist_outer_sq: list_params.rlist_outer * list_params.rlist_outer,
            rlist_inner_sq: list_params.rlist_inner * list_params.rlist_inner,
            dispersion_shift: ic.dispersion_shift,
            repulsion_shift: ic.repulsion_shift,
            vdw_switch: ic.vdw_switch,
        }
    }
}

/// Borrowed atom inputs for one launch.
#[derive(Clone, Copy)]
pub struct AtomDataView<'a> {
    pub xq: &'a [Float4],
    pub atom_types: &'a [i32],
    pub lj_comb: &'a [Float2],
    pub shift_vec: &'a [Float3],
}

/// Per-type parameter tables in the kernels' scaling conventions.
#[derive(Clone, Copy)]
pub struct PairTables<'a> {
    pub nbfp: &'a [Float2],
    pub nbfp_comb: &'a [Float2],
    pub ntypes: usize,
}

impl<'a> PairTables<'a> {
    /// `(6*C6, 12*C12)` of a type pair.
    pub fn pair(&self, type_i: i32, type_j: i32) -> Float2 {
        self.nbfp[type_i as usize * self.ntypes + type_j as usize]
    }

    pub fn comb(&self, type_index: i32) -> Float2 {
        self.nbfp_comb[type_index as usize]
    }
}

/// Borrowed accumulator outputs; energies and shift forces land in their
/// hashed slot regions and stay unreduced.
pub struct ForceOutputs<'a> {
    pub f: &'a mut [Float3],
    pub fshift: &'a mut [Float3],
    pub e_lj: &'a mut [f32],
    pub e_el: &'a mut [f32],
}

/// Lane-uniform launch flags; every lane of a group sees the same values.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForceKernelFlags {
    pub calc_energies: bool,
    pub calc_shift_forces: bool,
    pub prune: bool,
}

pub type ForceKernelFn = fn(
    &[SciEntry],
    &mut [Cj4Entry],
    &[ExclEntry],
    &AtomDataView<'_>,
    &KernelConsts,
    &PairTables<'_>,
    &[f32],
    &mut ForceOutputs<'_>,
    ForceKernelFlags,
);

/// Resolves a flavor pair to its monomorphized kernel; called once at
/// setup, the returned pointer is reused every step.
pub fn force_kernel_for(setup: KernelSetup) -> ForceKernelFn {
    match setup.vdw {
        VdwKind::Cutoff => elec_dispatch::<LjCutoff>(setup.elec),
        VdwKind::CutoffCombGeom => elec_dispatch::<LjCombGeom>(setup.elec),
        VdwKind::CutoffCombLB => elec_dispatch::<LjCombLB>(setup.elec),
        VdwKind::ForceSwitch => elec_dispatch::<LjForceSwitch>(setup.elec),
        VdwKind::PotSwitch => elec_dispatch::<LjPotSwitch>(setup.elec),
        VdwKind::EwaldCombGeom => elec_dispatch::<LjEwaldCombGeom>(setup.elec),
        VdwKind::EwaldCombLB => elec_dispatch::<LjEwaldCombLB>(setup.elec),
    }
}

fn elec_dispatch<V: models::VdwModel>(elec: ElecKind) -> ForceKernelFn {
    match elec {
        ElecKind::Cutoff => force_kernel::<ElecCutoff, V>,
        ElecKind::ReactionField => force_kernel::<ElecReactionField, V>,
        ElecKind::EwaldAnalytical => force_kernel::<EwaldAnalytical<false>, V>,
        ElecKind::EwaldAnalyticalTwin => force_kernel::<EwaldAnalytical<true>, V>,
        ElecKind::EwaldTabulated => force_kernel::<EwaldTabulated<false>, V>,
        ElecKind::EwaldTabulatedTwin => force_kernel::<EwaldTabulated<true>, V>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ENERGY_BUFFER_LEN, NUM_SHIFT_VECTORS, SHIFT_BUFFER_LEN};
    use crate::params::{ElecKind, VdwKind};

    #[test]
    fn every_flavor_pair_leaves_buffers_untouched_on_empty_list() {
        let elecs = [
            ElecKind::Cutoff,
            ElecKind::ReactionField,
            ElecKind::EwaldAnalytical,
            ElecKind::EwaldAnalyticalTwin,
            ElecKind::EwaldTabulated,
            ElecKind::EwaldTabulatedTwin,
        ];
        let vdws = [
            VdwKind::Cutoff,
            VdwKind::CutoffCombGeom,
            VdwKind::CutoffCombLB,
            VdwKind::ForceSwitch,
            VdwKind::PotSwitch,
            VdwKind::EwaldCombGeom,
            VdwKind::EwaldCombLB,
        ];
        let ic = InteractionConstants::from_settings(&crate::params::InteractionSettings {
            coulomb: crate::params::CoulombSetting::Ewald,
            ewald_beta: 3.0,
            ..Default::default()
        })
        .unwrap();
        let list_params = PairlistParams {
            rlist_outer: 1.1,
            rlist_inner: 1.0,
            use_dynamic_pruning: false,
        };
        let consts = KernelConsts::new(&ic, 1, &list_params, 2048.0);
        let shift_vec = vec![Float3::zero(); NUM_SHIFT_VECTORS];
        let atoms = AtomDataView {
            xq: &[],
            atom_types: &[],
            lj_comb: &[],
            shift_vec: &shift_vec,
        };
        let coulomb_tab = vec![0.0_f32; 4];
        let tables = PairTables {
            nbfp: &[],
            nbfp_comb: &[],
            ntypes: 0,
        };

        for &elec in &elecs {
            for &vdw in &vdws {
                let kernel = force_kernel_for(KernelSetup { elec, vdw });
                let mut f: Vec<Float3> = Vec::new();
                let mut fshift = vec![Float3::zero(); SHIFT_BUFFER_LEN];
                let mut e_lj = vec![0.0_f32; ENERGY_BUFFER_LEN];
                let mut e_el = vec![0.0_f32; ENERGY_BUFFER_LEN];
                let mut out = ForceOutputs {
                    f: &mut f,
                    fshift: &mut fshift,
                    e_lj: &mut e_lj,
                    e_el: &mut e_el,
                };
                kernel(
                    &[],
                    &mut [],
                    &[ExclEntry::interaction_all()],
                    &atoms,
                    &consts,
                    &tables,
                    &coulomb_tab,
                    &mut out,
                    ForceKernelFlags {
                        calc_energies: true,
                        calc_shift_forces: true,
                        prune: true,
                    },
                );
                assert!(e_lj.iter().chain(e_el.iter()).all(|&e| e == 0.0));
                assert!(fshift.iter().all(|v| v.to_array() == [0.0; 3]));
            }
        }
    }
}
