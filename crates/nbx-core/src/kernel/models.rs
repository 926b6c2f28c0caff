//! Electrostatics and van der Waals flavors as zero-sized marker types.
//! The force kernel is generic over one marker of each family, so every
//! flavor pair monomorphizes into its own straight-line pair loop.
//!
//! Conventions shared by all models: `int_bit` is 1.0 for interacting and
//! 0.0 for excluded atom pairs, `qi_qj` carries one factor of `epsfac`,
//! pair parameters are scaled as `(6*C6, 12*C12)` and the returned scalar
//! force is the magnitude over `r` (the caller multiplies by the pair
//! vector).

use std::f64::consts::PI;

use statrs::function::erf::erf;

use super::{AtomDataView, KernelConsts, PairTables};
use crate::vec::Float2;

pub trait ElecModel {
    /// Whether excluded in-range pairs must still run through the pair
    /// loop for their correction terms.
    fn exclusion_forces(calc_energies: bool) -> bool;

    /// Twin-range kernels re-check the VdW cut-off separately.
    const VDW_CUTOFF_CHECK: bool;

    fn force(
        consts: &KernelConsts,
        coulomb_tab: &[f32],
        qi_qj: f32,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
    ) -> f32;

    fn energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, r2: f32, inv_r: f32) -> f32;

    /// Factor applied to the accumulated squared charges of the diagonal
    /// self-interaction term.
    fn self_energy_prefactor(consts: &KernelConsts) -> f32;
}

pub trait VdwModel {
    /// Per-atom parameter the kernel preloads: the atom type for table
    /// lookups or the combination-rule pair for per-atom combination.
    type AtomParam: Copy + Default;

    const IS_LJ_EWALD: bool;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> Self::AtomParam;

    /// Evaluates the Lennard-Jones term of one pair, returning the scalar
    /// force and the shifted pair energy. The energy is valid whenever
    /// requested; the potential switch evaluates it unconditionally since
    /// its force depends on it.
    #[allow(clippy::too_many_arguments)]
    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: Self::AtomParam,
        param_j: Self::AtomParam,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32);
}

fn erf_f32(x: f32) -> f32 {
    erf(x as f64) as f32
}

/// Ewald real-space correction force as a function of `(beta*r)^2`;
/// multiplied by `beta^3` it turns the bare Coulomb force into the
/// short-range erfc force. Exact counterpart of the tabulated values.
fn ewald_correction_force(z2: f32) -> f32 {
    let z = (z2 as f64).sqrt();
    (-(erf(z) - 2.0 * z * (-z * z).exp() / PI.sqrt()) / (z * z * z)) as f32
}

fn interpolate(tab: &[f32], scale: f32, r: f32) -> f32 {
    let normalized = r * scale;
    let index = normalized as usize;
    let fraction = normalized - index as f32;
    let left = tab[index];
    left + fraction * (tab[index + 1] - left)
}

pub struct ElecCutoff;

impl ElecModel for ElecCutoff {
    fn exclusion_forces(calc_energies: bool) -> bool {
        // Plain cut-off needs the excluded pairs only for the potential
        // shift in the energy terms.
        calc_energies
    }

    const VDW_CUTOFF_CHECK: bool = false;

    fn force(
        _consts: &KernelConsts,
        _coulomb_tab: &[f32],
        qi_qj: f32,
        int_bit: f32,
        _r2: f32,
        inv_r: f32,
        inv_r2: f32,
    ) -> f32 {
        qi_qj * int_bit * inv_r2 * inv_r
    }

    fn energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, _r2: f32, inv_r: f32) -> f32 {
        qi_qj * (int_bit * inv_r - consts.c_rf)
    }

    fn self_energy_prefactor(consts: &KernelConsts) -> f32 {
        -0.5 * consts.c_rf
    }
}

pub struct ElecReactionField;

impl ElecModel for ElecReactionField {
    fn exclusion_forces(_calc_energies: bool) -> bool {
        true
    }

    const VDW_CUTOFF_CHECK: bool = false;

    fn force(
        consts: &KernelConsts,
        _coulomb_tab: &[f32],
        qi_qj: f32,
        int_bit: f32,
        _r2: f32,
        inv_r: f32,
        inv_r2: f32,
    ) -> f32 {
        qi_qj * (int_bit * inv_r2 * inv_r - consts.two_k_rf)
    }

    fn energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, r2: f32, inv_r: f32) -> f32 {
        qi_qj * (int_bit * inv_r + 0.5 * consts.two_k_rf * r2 - consts.c_rf)
    }

    fn self_energy_prefactor(consts: &KernelConsts) -> f32 {
        -0.5 * consts.c_rf
    }
}

fn ewald_energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, r2: f32, inv_r: f32) -> f32 {
    let r = r2 * inv_r;
    qi_qj * (inv_r * (int_bit - erf_f32(r * consts.ewald_beta)) - int_bit * consts.sh_ewald)
}

fn ewald_self_energy_prefactor(consts: &KernelConsts) -> f32 {
    -(consts.ewald_beta as f64 / PI.sqrt()) as f32
}

pub struct EwaldAnalytical<const TWIN_CUTOFF: bool>;

impl<const TWIN_CUTOFF: bool> ElecModel for EwaldAnalytical<TWIN_CUTOFF> {
    fn exclusion_forces(_calc_energies: bool) -> bool {
        true
    }

    const VDW_CUTOFF_CHECK: bool = TWIN_CUTOFF;

    fn force(
        consts: &KernelConsts,
        _coulomb_tab: &[f32],
        qi_qj: f32,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
    ) -> f32 {
        let beta = consts.ewald_beta;
        let correction = ewald_correction_force(beta * beta * r2) * beta * beta * beta;
        qi_qj * (int_bit * inv_r2 * inv_r + correction)
    }

    fn energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, r2: f32, inv_r: f32) -> f32 {
        ewald_energy(consts, qi_qj, int_bit, r2, inv_r)
    }

    fn self_energy_prefactor(consts: &KernelConsts) -> f32 {
        ewald_self_energy_prefactor(consts)
    }
}

pub struct EwaldTabulated<const TWIN_CUTOFF: bool>;

impl<const TWIN_CUTOFF: bool> ElecModel for EwaldTabulated<TWIN_CUTOFF> {
    fn exclusion_forces(_calc_energies: bool) -> bool {
        true
    }

    const VDW_CUTOFF_CHECK: bool = TWIN_CUTOFF;

    fn force(
        consts: &KernelConsts,
        coulomb_tab: &[f32],
        qi_qj: f32,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
    ) -> f32 {
        let r = r2 * inv_r;
        let correction = interpolate(coulomb_tab, consts.coulomb_tab_scale, r);
        qi_qj * (int_bit * inv_r2 - correction) * inv_r
    }

    fn energy(consts: &KernelConsts, qi_qj: f32, int_bit: f32, r2: f32, inv_r: f32) -> f32 {
        ewald_energy(consts, qi_qj, int_bit, r2, inv_r)
    }

    fn self_energy_prefactor(consts: &KernelConsts) -> f32 {
        ewald_self_energy_prefactor(consts)
    }
}

/// Shifted 12-6 evaluation shared by every flavor that reaches the plain
/// `(6*C6, 12*C12)` representation.
fn lj_core(
    consts: &KernelConsts,
    c6: f32,
    c12: f32,
    int_bit: f32,
    inv_r2: f32,
    calc_energy: bool,
) -> (f32, f32) {
    let inv_r6 = inv_r2 * inv_r2 * inv_r2 * int_bit;
    let f = inv_r6 * (c12 * inv_r6 - c6) * inv_r2;
    let e = if calc_energy {
        int_bit
            * (c12 * (inv_r6 * inv_r6 + consts.repulsion_shift.cpot) * (1.0 / 12.0)
                - c6 * (inv_r6 + consts.dispersion_shift.cpot) * (1.0 / 6.0))
    } else {
        0.0
    };
    (f, e)
}

/// LJ-PME grid correction shared by the geometric and LB flavors; the
/// plain r^-6 term stays unmasked because the long-range grid includes
/// excluded pairs.
fn lj_ewald_grid(
    consts: &KernelConsts,
    c6_grid: f32,
    int_bit: f32,
    r2: f32,
    inv_r2: f32,
    calc_energy: bool,
) -> (f32, f32) {
    let inv_r6_nm = inv_r2 * inv_r2 * inv_r2;
    let cr2 = consts.lje_coeff2 * r2;
    let expmcr2 = (-cr2).exp();
    let poly = 1.0 + cr2 + 0.5 * cr2 * cr2;
    let f = c6_grid * (inv_r6_nm - expmcr2 * (inv_r6_nm * poly + consts.lje_coeff6_6)) * inv_r2;
    let e = if calc_energy {
        (1.0 / 6.0) * c6_grid * (inv_r6_nm * (1.0 - expmcr2 * poly) + int_bit * consts.sh_lj_ewald)
    } else {
        0.0
    };
    (f, e)
}

pub struct LjCutoff;

impl VdwModel for LjCutoff {
    type AtomParam = i32;

    const IS_LJ_EWALD: bool = false;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> i32 {
        atoms.atom_types[index]
    }

    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: i32,
        param_j: i32,
        int_bit: f32,
        _r2: f32,
        _inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let pair = tables.pair(param_i, param_j);
        lj_core(consts, pair.x, pair.y, int_bit, inv_r2, calc_energy)
    }
}

pub struct LjCombGeom;

impl VdwModel for LjCombGeom {
    type AtomParam = Float2;

    const IS_LJ_EWALD: bool = false;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> Float2 {
        atoms.lj_comb[index]
    }

    fn eval(
        consts: &KernelConsts,
        _tables: &PairTables<'_>,
        param_i: Float2,
        param_j: Float2,
        int_bit: f32,
        _r2: f32,
        _inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let pair = param_i.mul(param_j);
        lj_core(consts, pair.x, pair.y, int_bit, inv_r2, calc_energy)
    }
}

pub struct LjCombLB;

impl VdwModel for LjCombLB {
    type AtomParam = Float2;

    const IS_LJ_EWALD: bool = false;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> Float2 {
        atoms.lj_comb[index]
    }

    fn eval(
        consts: &KernelConsts,
        _tables: &PairTables<'_>,
        param_i: Float2,
        param_j: Float2,
        int_bit: f32,
        _r2: f32,
        inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let sigma = param_i.x + param_j.x;
        let epsilon = param_i.y * param_j.y;
        if calc_energy {
            let sigma2 = sigma * sigma;
            let sigma6 = sigma2 * sigma2 * sigma2;
            let c6 = epsilon * sigma6;
            let c12 = c6 * sigma6;
            lj_core(consts, c6, c12, int_bit, inv_r2, true)
        } else {
            let sig_r = sigma * inv_r;
            let sig_r2 = sig_r * sig_r;
            let sig_r6 = sig_r2 * sig_r2 * sig_r2 * int_bit;
            let f = epsilon * sig_r6 * (sig_r6 - 1.0) * inv_r2;
            (f, 0.0)
        }
    }
}

pub struct LjForceSwitch;

impl VdwModel for LjForceSwitch {
    type AtomParam = i32;

    const IS_LJ_EWALD: bool = false;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> i32 {
        atoms.atom_types[index]
    }

    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: i32,
        param_j: i32,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let pair = tables.pair(param_i, param_j);
        let (mut f, mut e) = lj_core(consts, pair.x, pair.y, int_bit, inv_r2, calc_energy);
        let r = r2 * inv_r;
        let t = (r - consts.rvdw_switch).max(0.0);
        let disp = consts.dispersion_shift;
        let rep = consts.repulsion_shift;
        f += (-pair.x * (disp.c2 + disp.c3 * t) + pair.y * (rep.c2 + rep.c3 * t)) * t * t * inv_r;
        if calc_energy {
            let t3 = t * t * t;
            e += pair.x * (disp.c2 * (1.0 / 3.0) + disp.c3 * (1.0 / 4.0) * t) * t3
                - pair.y * (rep.c2 * (1.0 / 3.0) + rep.c3 * (1.0 / 4.0) * t) * t3;
        }
        (f, e)
    }
}

pub struct LjPotSwitch;

impl VdwModel for LjPotSwitch {
    type AtomParam = i32;

    const IS_LJ_EWALD: bool = false;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> i32 {
        atoms.atom_types[index]
    }

    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: i32,
        param_j: i32,
        int_bit: f32,
        r2: f32,
        inv_r: f32,
        inv_r2: f32,
        _calc_energy: bool,
    ) -> (f32, f32) {
        let pair = tables.pair(param_i, param_j);
        // The switch scales force and energy together, so the pair energy
        // is needed even in force-only passes.
        let (f, e) = lj_core(consts, pair.x, pair.y, int_bit, inv_r2, true);
        let r = r2 * inv_r;
        let t = r - consts.rvdw_switch;
        if t > 0.0 {
            let sw_c = consts.vdw_switch;
            let sw = 1.0 + (sw_c.c3 + (sw_c.c4 + sw_c.c5 * t) * t) * t * t * t;
            let dsw = (3.0 * sw_c.c3 + (4.0 * sw_c.c4 + 5.0 * sw_c.c5 * t) * t) * t * t;
            (f * sw - inv_r * e * dsw, e * sw)
        } else {
            (f, e)
        }
    }
}

pub struct LjEwaldCombGeom;

impl VdwModel for LjEwaldCombGeom {
    type AtomParam = i32;

    const IS_LJ_EWALD: bool = true;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> i32 {
        atoms.atom_types[index]
    }

    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: i32,
        param_j: i32,
        int_bit: f32,
        r2: f32,
        _inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let pair = tables.pair(param_i, param_j);
        let (f, e) = lj_core(consts, pair.x, pair.y, int_bit, inv_r2, calc_energy);
        let c6_grid = tables.comb(param_i).x * tables.comb(param_j).x;
        let (fg, eg) = lj_ewald_grid(consts, c6_grid, int_bit, r2, inv_r2, calc_energy);
        (f + fg, e + eg)
    }
}

pub struct LjEwaldCombLB;

impl VdwModel for LjEwaldCombLB {
    type AtomParam = i32;

    const IS_LJ_EWALD: bool = true;

    fn atom_param(atoms: &AtomDataView<'_>, index: usize) -> i32 {
        atoms.atom_types[index]
    }

    fn eval(
        consts: &KernelConsts,
        tables: &PairTables<'_>,
        param_i: i32,
        param_j: i32,
        int_bit: f32,
        r2: f32,
        _inv_r: f32,
        inv_r2: f32,
        calc_energy: bool,
    ) -> (f32, f32) {
        let pair = tables.pair(param_i, param_j);
        let (f, e) = lj_core(consts, pair.x, pair.y, int_bit, inv_r2, calc_energy);
        let comb_i = tables.comb(param_i);
        let comb_j = tables.comb(param_j);
        let sigma = comb_i.x + comb_j.x;
        let epsilon = comb_i.y * comb_j.y;
        let sigma2 = sigma * sigma;
        let c6_grid = epsilon * sigma2 * sigma2 * sigma2;
        let (fg, eg) = lj_ewald_grid(consts, c6_grid, int_bit, r2, inv_r2, calc_energy);
        (f + fg, e + eg)
    }
}
