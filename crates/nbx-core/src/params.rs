//! Interaction constants, per-type nonbonded parameter tables and kernel
//! flavor selection.
//!
//! The constants follow the conventions the kernels assume: pair tables
//! store `(6*C6, 12*C12)`, combination-rule tables store `(sqrt(6*C6),
//! sqrt(12*C12))` for geometric combination and `(2^(1/6)*sigma/2,
//! sqrt(12*epsilon))` for Lorentz-Berthelot.

use std::f64::consts::PI;

use statrs::function::erf::{erf, erfc};

use crate::error::{CoreError, CoreResult};
use crate::vec::Float2;

/// Coulomb constant 1/(4 pi eps0) in kJ mol^-1 nm e^-2.
pub const ONE_4PI_EPS0: f64 = 138.935_458;

/// Resolution of the tabulated Ewald correction force, points per unit of
/// distance.
pub const COULOMB_TABLE_DENSITY: f64 = 2048.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoulombSetting {
    Cutoff,
    ReactionField,
    Ewald,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VdwSetting {
    Cutoff,
    Pme,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VdwModifier {
    None,
    PotShift,
    ForceSwitch,
    PotSwitch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LjCombinationRule {
    None,
    Geometric,
    LorentzBerthelot,
}

/// Shift constants for one r^-p term: `c2`/`c3` drive the force switch,
/// `cpot` the potential shift at the cut-off.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SwitchConstants {
    pub c2: f32,
    pub c3: f32,
    pub cpot: f32,
}

/// Coefficients of the quintic switch polynomial
/// `1 + c3*t^3 + c4*t^4 + c5*t^5` with `t = r - r_switch`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PotSwitchConstants {
    pub c3: f32,
    pub c4: f32,
    pub c5: f32,
}

/// Primary inputs describing the short-range interaction setup.
#[derive(Clone, Copy, Debug)]
pub struct InteractionSettings {
    pub coulomb: CoulombSetting,
    pub vdw: VdwSetting,
    pub vdw_modifier: VdwModifier,
    /// Relative dielectric permittivity.
    pub epsilon_r: f32,
    /// Reaction-field permittivity beyond the cut-off; 0 means a
    /// conducting boundary.
    pub epsilon_rf: f32,
    pub r_coulomb: f32,
    pub r_vdw: f32,
    pub r_vdw_switch: f32,
    pub ewald_beta: f32,
    pub ewaldcoeff_lj: f32,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            coulomb: CoulombSetting::Cutoff,
            vdw: VdwSetting::Cutoff,
            vdw_modifier: VdwModifier::PotShift,
            epsilon_r: 1.0,
            epsilon_rf: 0.0,
            r_coulomb: 1.0,
            r_vdw: 1.0,
            r_vdw_switch: 0.0,
            ewald_beta: 0.0,
            ewaldcoeff_lj: 0.0,
        }
    }
}

/// Derived scalar constants consumed by the kernels. Built once from
/// [`InteractionSettings`] and rebuilt when cut-off tuning changes them.
#[derive(Clone, Copy, Debug)]
pub struct InteractionConstants {
    pub coulomb: CoulombSetting,
    pub vdw: VdwSetting,
    pub vdw_modifier: VdwModifier,
    pub epsfac: f32,
    pub r_coulomb: f32,
    pub r_vdw: f32,
    pub r_vdw_switch: f32,
    pub ewald_beta: f32,
    /// Ewald potential shift, erfc(beta * r_coulomb).
    pub sh_ewald: f32,
    /// LJ-PME potential shift of the grid correction term.
    pub sh_lj_ewald: f32,
    pub ewaldcoeff_lj: f32,
    /// Reaction-field k_rf.
    pub reaction_field_coeff: f32,
    /// Reaction-field (or plain cut-off) potential shift c_rf.
    pub reaction_field_shift: f32,
    pub dispersion_shift: SwitchConstants,
    pub repulsion_shift: SwitchConstants,
    pub vdw_switch: PotSwitchConstants,
}

impl InteractionConstants {
    pub fn from_settings(s: &InteractionSettings) -> CoreResult<Self> {
        if !(s.epsilon_r > 0.0) {
            return Err(CoreError::Invalid(format!(
                "relative permittivity must be positive, got {}",
                s.epsilon_r
            )));
        }
        if !(s.r_coulomb > 0.0) || !(s.r_vdw > 0.0) {
            return Err(CoreError::Invalid(format!(
                "cut-offs must be positive, got rcoulomb {} rvdw {}",
                s.r_coulomb, s.r_vdw
            )));
        }
        if s.coulomb == CoulombSetting::Ewald && !(s.ewald_beta > 0.0) {
            return Err(CoreError::Invalid(format!(
                "ewald splitting coefficient must be positive, got {}",
                s.ewald_beta
            )));
        }
        if s.vdw == VdwSetting::Pme && !(s.ewaldcoeff_lj > 0.0) {
            return Err(CoreError::Invalid(format!(
                "lj-pme coefficient must be positive, got {}",
                s.ewaldcoeff_lj
            )));
        }

        let rc = s.r_coulomb as f64;
        let rv = s.r_vdw as f64;

        let (k_rf, c_rf) = match s.coulomb {
            CoulombSetting::Cutoff => (0.0, 1.0 / rc),
            CoulombSetting::ReactionField => {
                let eps_r = s.epsilon_r as f64;
                let eps_rf = s.epsilon_rf as f64;
                let k_rf = if eps_rf == 0.0 {
                    // Conducting boundary.
                    0.5 / (rc * rc * rc)
                } else {
                    (eps_rf - eps_r) / (2.0 * eps_rf + eps_r) / (rc * rc * rc)
                };
                (k_rf, 1.0 / rc + k_rf * rc * rc)
            }
            CoulombSetting::Ewald => (0.0, 0.0),
        };

        let sh_ewald = match s.coulomb {
            CoulombSetting::Ewald => erfc(s.ewald_beta as f64 * rc),
            _ => 0.0,
        };

        let mut dispersion_shift = SwitchConstants::default();
        let mut repulsion_shift = SwitchConstants::default();
        let mut vdw_switch = PotSwitchConstants::default();
        match s.vdw_modifier {
            VdwModifier::None => {}
            VdwModifier::PotShift => {
                dispersion_shift.cpot = (-1.0 / rv.powi(6)) as f32;
                repulsion_shift.cpot = (-1.0 / rv.powi(12)) as f32;
            }
            VdwModifier::ForceSwitch => {
                let rsw = switch_range(s)?;
                dispersion_shift = force_switch_constants(6.0, rsw, rv);
                repulsion_shift = force_switch_constants(12.0, rsw, rv);
            }
            VdwModifier::PotSwitch => {
                let rsw = switch_range(s)?;
                let d = rv - rsw;
                vdw_switch = PotSwitchConstants {
                    c3: (-10.0 / d.powi(3)) as f32,
                    c4: (15.0 / d.powi(4)) as f32,
                    c5: (-6.0 / d.powi(5)) as f32,
                };
            }
        }

        let sh_lj_ewald = if s.vdw == VdwSetting::Pme {
            let crc2 = (s.ewaldcoeff_lj as f64 * rv).powi(2);
            ((-crc2).exp() * (1.0 + crc2 + 0.5 * crc2 * crc2) - 1.0) / rv.powi(6)
        } else {
            0.0
        };

        Ok(Self {
            coulomb: s.coulomb,
            vdw: s.vdw,
            vdw_modifier: s.vdw_modifier,
            epsfac: (ONE_4PI_EPS0 / s.epsilon_r as f64) as f32,
            r_coulomb: s.r_coulomb,
            r_vdw: s.r_vdw,
            r_vdw_switch: s.r_vdw_switch,
            ewald_beta: s.ewald_beta,
            sh_ewald: sh_ewald as f32,
            sh_lj_ewald: sh_lj_ewald as f32,
            ewaldcoeff_lj: s.ewaldcoeff_lj,
            reaction_field_coeff: k_rf as f32,
            reaction_field_shift: c_rf as f32,
            dispersion_shift,
            repulsion_shift,
            vdw_switch,
        })
    }
}

fn switch_range(s: &InteractionSettings) -> CoreResult<f64> {
    if !(s.r_vdw_switch >= 0.0) || s.r_vdw_switch >= s.r_vdw {
        return Err(CoreError::Invalid(format!(
            "switch radius {} must lie within [0, rvdw = {})",
            s.r_vdw_switch, s.r_vdw
        )));
    }
    Ok(s.r_vdw_switch as f64)
}

/// Coefficients shifting the force of an r^-p term to zero between `rsw`
/// and the cut-off `rc`.
fn force_switch_constants(p: f64, rsw: f64, rc: f64) -> SwitchConstants {
    let d = rc - rsw;
    let c2 = ((p + 4.0) * rc - (p + 1.0) * rsw) / (rc.powf(p + 2.0) * d * d);
    let c3 = -((p + 3.0) * rc - (p + 1.0) * rsw) / (rc.powf(p + 2.0) * d * d * d);
    let cpot = -1.0 / rc.powf(p) + p * c2 / 3.0 * d.powi(3) + p * c3 / 4.0 * d.powi(4);
    SwitchConstants {
        c2: c2 as f32,
        c3: c3 as f32,
        cpot: cpot as f32,
    }
}

/// Electrostatics kernel flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElecKind {
    Cutoff,
    ReactionField,
    EwaldAnalytical,
    EwaldAnalyticalTwin,
    EwaldTabulated,
    EwaldTabulatedTwin,
}

impl ElecKind {
    pub fn is_ewald(self) -> bool {
        !matches!(self, ElecKind::Cutoff | ElecKind::ReactionField)
    }

    pub fn is_tabulated(self) -> bool {
        matches!(self, ElecKind::EwaldTabulated | ElecKind::EwaldTabulatedTwin)
    }

    /// Whether the VdW cut-off is checked separately from the Coulomb one.
    pub fn is_twin_cut(self) -> bool {
        matches!(
            self,
            ElecKind::EwaldAnalyticalTwin | ElecKind::EwaldTabulatedTwin
        )
    }
}

/// Van der Waals kernel flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VdwKind {
    Cutoff,
    CutoffCombGeom,
    CutoffCombLB,
    ForceSwitch,
    PotSwitch,
    EwaldCombGeom,
    EwaldCombLB,
}

impl VdwKind {
    /// Kernels loading per-atom combination parameters instead of atom
    /// types; decides the shared-memory layout of the i-cluster preload.
    pub fn uses_lj_comb(self) -> bool {
        matches!(self, VdwKind::CutoffCombGeom | VdwKind::CutoffCombLB)
    }

    pub fn is_lj_ewald(self) -> bool {
        matches!(self, VdwKind::EwaldCombGeom | VdwKind::EwaldCombLB)
    }
}

/// The pair of flavors a dispatch resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelSetup {
    pub elec: ElecKind,
    pub vdw: VdwKind,
}

/// Environment overrides of the Ewald kernel choice.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvOverrides {
    pub force_analytical_ewald: bool,
    pub force_tabulated_ewald: bool,
    pub force_twin_cutoff: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            force_analytical_ewald: std::env::var_os("NBX_ANA_EWALD").is_some(),
            force_tabulated_ewald: std::env::var_os("NBX_TAB_EWALD").is_some(),
            force_twin_cutoff: std::env::var_os("NBX_EWALD_TWINCUT").is_some(),
        }
    }
}

pub fn pick_elec_kind(
    ic: &InteractionConstants,
    overrides: &EnvOverrides,
) -> CoreResult<ElecKind> {
    match ic.coulomb {
        CoulombSetting::Cutoff | CoulombSetting::ReactionField => {
            if ic.r_coulomb != ic.r_vdw {
                return Err(CoreError::Mismatch(format!(
                    "coulomb and vdw cut-offs must match without ewald, got {} and {}",
                    ic.r_coulomb, ic.r_vdw
                )));
            }
            Ok(match ic.coulomb {
                CoulombSetting::Cutoff => ElecKind::Cutoff,
                _ => ElecKind::ReactionField,
            })
        }
        CoulombSetting::Ewald => {
            if overrides.force_analytical_ewald && overrides.force_tabulated_ewald {
                return Err(CoreError::Invalid(
                    "both analytical and tabulated ewald kernels requested".into(),
                ));
            }
            if overrides.force_analytical_ewald {
                log::warn!("using analytical ewald kernels (requested by environment)");
            } else if overrides.force_tabulated_ewald {
                log::warn!("using tabulated ewald kernels (requested by environment)");
            }
            let analytical = !overrides.force_tabulated_ewald;
            let twin = ic.r_coulomb != ic.r_vdw || overrides.force_twin_cutoff;
            Ok(match (analytical, twin) {
                (true, false) => ElecKind::EwaldAnalytical,
                (true, true) => ElecKind::EwaldAnalyticalTwin,
                (false, false) => ElecKind::EwaldTabulated,
                (false, true) => ElecKind::EwaldTabulatedTwin,
            })
        }
    }
}

pub fn pick_vdw_kind(
    ic: &InteractionConstants,
    comb_rule: LjCombinationRule,
    ljpme_comb_rule: LjCombinationRule,
) -> CoreResult<VdwKind> {
    match ic.vdw {
        VdwSetting::Cutoff => match ic.vdw_modifier {
            VdwModifier::None | VdwModifier::PotShift => Ok(match comb_rule {
                LjCombinationRule::None => VdwKind::Cutoff,
                LjCombinationRule::Geometric => VdwKind::CutoffCombGeom,
                LjCombinationRule::LorentzBerthelot => VdwKind::CutoffCombLB,
            }),
            VdwModifier::ForceSwitch => Ok(VdwKind::ForceSwitch),
            VdwModifier::PotSwitch => Ok(VdwKind::PotSwitch),
        },
        VdwSetting::Pme => {
            if !matches!(
                ic.vdw_modifier,
                VdwModifier::None | VdwModifier::PotShift
            ) {
                return Err(CoreError::Unsupported(format!(
                    "lj-pme cannot be combined with modifier {:?}",
                    ic.vdw_modifier
                )));
            }
            match ljpme_comb_rule {
                LjCombinationRule::Geometric | LjCombinationRule::LorentzBerthelot => {
                    if comb_rule != ljpme_comb_rule {
                        return Err(CoreError::Mismatch(format!(
                            "combination rules for long- and short-range interactions \
                             should match, got {:?} and {:?}",
                            ljpme_comb_rule, comb_rule
                        )));
                    }
                    Ok(match ljpme_comb_rule {
                        LjCombinationRule::Geometric => VdwKind::EwaldCombGeom,
                        _ => VdwKind::EwaldCombLB,
                    })
                }
                LjCombinationRule::None => Err(CoreError::Invalid(
                    "lj-pme requires a geometric or lorentz-berthelot combination rule".into(),
                )),
            }
        }
    }
}

pub fn pick_kernel_setup(
    ic: &InteractionConstants,
    params: &NonbondedParamsHost,
    overrides: &EnvOverrides,
) -> CoreResult<KernelSetup> {
    let elec = pick_elec_kind(ic, overrides)?;
    let vdw = pick_vdw_kind(ic, params.comb_rule, params.ljpme_comb_rule)?;
    log::debug!("selected nonbonded kernel flavors: {:?} / {:?}", elec, vdw);
    Ok(KernelSetup { elec, vdw })
}

/// Host-side per-type nonbonded parameter tables.
#[derive(Clone, Debug)]
pub struct NonbondedParamsHost {
    pub ntypes: usize,
    /// `(6*C6, 12*C12)` per type pair, row-major `ntypes * ntypes`.
    pub nbfp: Vec<Float2>,
    /// Per-type combination parameters; may be empty when no kernel
    /// flavor reads them.
    pub nbfp_comb: Vec<Float2>,
    pub comb_rule: LjCombinationRule,
    pub ljpme_comb_rule: LjCombinationRule,
}

impl NonbondedParamsHost {
    pub fn new(
        ntypes: usize,
        nbfp: Vec<Float2>,
        nbfp_comb: Vec<Float2>,
        comb_rule: LjCombinationRule,
        ljpme_comb_rule: LjCombinationRule,
    ) -> CoreResult<Self> {
        if nbfp.len() != ntypes * ntypes {
            return Err(CoreError::Mismatch(format!(
                "pair table has {} entries, expected {} for {} types",
                nbfp.len(),
                ntypes * ntypes,
                ntypes
            )));
        }
        if !nbfp_comb.is_empty() && nbfp_comb.len() != ntypes {
            return Err(CoreError::Mismatch(format!(
                "combination table has {} entries, expected {}",
                nbfp_comb.len(),
                ntypes
            )));
        }
        Ok(Self {
            ntypes,
            nbfp,
            nbfp_comb,
            comb_rule,
            ljpme_comb_rule,
        })
    }

    /// Builds the pair and combination tables from per-type C6/C12 using
    /// geometric combination.
    pub fn from_c6_c12_geometric(c6: &[f32], c12: &[f32]) -> CoreResult<Self> {
        if c6.len() != c12.len() {
            return Err(CoreError::Mismatch(format!(
                "c6 and c12 lists differ in length: {} vs {}",
                c6.len(),
                c12.len()
            )));
        }
        let nt = c6.len();
        let mut nbfp = Vec::with_capacity(nt * nt);
        for i in 0..nt {
            for j in 0..nt {
                nbfp.push(Float2::new(
                    6.0 * (c6[i] * c6[j]).sqrt(),
                    12.0 * (c12[i] * c12[j]).sqrt(),
                ));
            }
        }
        let nbfp_comb = (0..nt)
            .map(|i| Float2::new((6.0 * c6[i]).sqrt(), (12.0 * c12[i]).sqrt()))
            .collect();
        Self::new(
            nt,
            nbfp,
            nbfp_comb,
            LjCombinationRule::Geometric,
            LjCombinationRule::Geometric,
        )
    }

    /// Builds the tables from per-type sigma/epsilon with Lorentz-Berthelot
    /// combination.
    pub fn from_sigma_epsilon_lb(sigma: &[f32], epsilon: &[f32]) -> CoreResult<Self> {
        if sigma.len() != epsilon.len() {
            return Err(CoreError::Mismatch(format!(
                "sigma and epsilon lists differ in length: {} vs {}",
                sigma.len(),
                epsilon.len()
            )));
        }
        let nt = sigma.len();
        let mut nbfp = Vec::with_capacity(nt * nt);
        for i in 0..nt {
            for j in 0..nt {
                let sig = 0.5 * (sigma[i] + sigma[j]);
                let eps = (epsilon[i] * epsilon[j]).sqrt();
                let c6 = 4.0 * eps * sig.powi(6);
                let c12 = 4.0 * eps * sig.powi(12);
                nbfp.push(Float2::new(6.0 * c6, 12.0 * c12));
            }
        }
        let half_sixth_root = 0.5 * 2.0_f32.powf(1.0 / 6.0);
        let nbfp_comb = (0..nt)
            .map(|i| Float2::new(half_sixth_root * sigma[i], (12.0 * epsilon[i]).sqrt()))
            .collect();
        Self::new(
            nt,
            nbfp,
            nbfp_comb,
            LjCombinationRule::LorentzBerthelot,
            LjCombinationRule::LorentzBerthelot,
        )
    }
}

/// Uniformly sampled Ewald correction force
/// `F(r) = erf(beta r)/r^2 - 2 beta exp(-(beta r)^2)/(sqrt(pi) r)`.
#[derive(Clone, Debug)]
pub struct CoulombForceTable {
    pub data: Vec<f32>,
    /// Samples per unit of distance; index = r * scale.
    pub scale: f32,
}

impl CoulombForceTable {
    /// Linear interpolation at distance `r`; callers keep `r` below the
    /// cut-off the table was built for.
    pub fn interpolate(&self, r: f32) -> f32 {
        let normalized = r * self.scale;
        let index = normalized as usize;
        let fraction = normalized - index as f32;
        let left = self.data[index];
        let right = self.data[index + 1];
        left + fraction * (right - left)
    }
}

pub fn build_coulomb_force_table(ewald_beta: f32, r_coulomb: f32) -> CoreResult<CoulombForceTable> {
    if !(ewald_beta > 0.0) || !(r_coulomb > 0.0) {
        return Err(CoreError::Invalid(format!(
            "ewald table needs positive beta and cut-off, got {} and {}",
            ewald_beta, r_coulomb
        )));
    }
    let beta = ewald_beta as f64;
    let len = (r_coulomb as f64 * COULOMB_TABLE_DENSITY).ceil() as usize + 2;
    let mut data = Vec::with_capacity(len);
    // The correction force tends to zero at the origin.
    data.push(0.0_f32);
    for i in 1..len {
        let r = i as f64 / COULOMB_TABLE_DENSITY;
        let value = erf(beta * r) / (r * r)
            - 2.0 * beta * (-beta * beta * r * r).exp() / (PI.sqrt() * r);
        data.push(value as f32);
    }
    Ok(CoulombForceTable {
        data,
        scale: COULOMB_TABLE_DENSITY as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ewald_settings() -> InteractionSettings {
        InteractionSettings {
            coulomb: CoulombSetting::Ewald,
            ewald_beta: 3.12,
            ..InteractionSettings::default()
        }
    }

    #[test]
    fn conducting_reaction_field_constants() {
        let ic = InteractionConstants::from_settings(&InteractionSettings {
            coulomb: CoulombSetting::ReactionField,
            r_coulomb: 0.9,
            r_vdw: 0.9,
            ..InteractionSettings::default()
        })
        .unwrap();
        let rc = 0.9_f64;
        let k_rf = 0.5 / (rc * rc * rc);
        assert!((ic.reaction_field_coeff as f64 - k_rf).abs() < 1e-6);
        assert!((ic.reaction_field_shift as f64 - 1.5 / rc).abs() < 1e-6);
    }

    #[test]
    fn force_switch_zeroes_force_at_cutoff() {
        // The switched force of an r^-p term is
        // -p/r^(p+1) - p*(c2*t^2 + c3*t^3), which must vanish at r = rc.
        let ic = InteractionConstants::from_settings(&InteractionSettings {
            vdw_modifier: VdwModifier::ForceSwitch,
            r_vdw: 1.0,
            r_vdw_switch: 0.9,
            ..InteractionSettings::default()
        })
        .unwrap();
        let t = (1.0 - 0.9_f64) as f32;
        for (p, sc) in [(6.0_f32, ic.dispersion_shift), (12.0, ic.repulsion_shift)] {
            let plain = -p;
            let switched = -p * (sc.c2 + sc.c3 * t) * t * t;
            assert!((plain - switched).abs() < 2e-3 * p, "p = {p}");
        }
    }

    #[test]
    fn mismatched_cutoffs_rejected_without_ewald() {
        let ic = InteractionConstants::from_settings(&InteractionSettings {
            coulomb: CoulombSetting::ReactionField,
            r_coulomb: 1.2,
            r_vdw: 1.0,
            ..InteractionSettings::default()
        })
        .unwrap();
        assert!(pick_elec_kind(&ic, &EnvOverrides::default()).is_err());
    }

    #[test]
    fn ewald_selection_honors_overrides() {
        let ic = InteractionConstants::from_settings(&ewald_settings()).unwrap();
        let defaults = EnvOverrides::default();
        assert_eq!(pick_elec_kind(&ic, &defaults).unwrap(), ElecKind::EwaldAnalytical);

        let tabulated = EnvOverrides {
            force_tabulated_ewald: true,
            ..EnvOverrides::default()
        };
        assert_eq!(pick_elec_kind(&ic, &tabulated).unwrap(), ElecKind::EwaldTabulated);

        let twin = EnvOverrides {
            force_twin_cutoff: true,
            ..EnvOverrides::default()
        };
        assert_eq!(pick_elec_kind(&ic, &twin).unwrap(), ElecKind::EwaldAnalyticalTwin);

        let conflicting = EnvOverrides {
            force_analytical_ewald: true,
            force_tabulated_ewald: true,
            ..EnvOverrides::default()
        };
        assert!(pick_elec_kind(&ic, &conflicting).is_err());
    }

    #[test]
    fn twin_cutoff_selected_for_unequal_radii() {
        let ic = InteractionConstants::from_settings(&InteractionSettings {
            r_coulomb: 1.2,
            r_vdw: 1.0,
            ..ewald_settings()
        })
        .unwrap();
        assert_eq!(
            pick_elec_kind(&ic, &EnvOverrides::default()).unwrap(),
            ElecKind::EwaldAnalyticalTwin
        );
    }

    #[test]
    fn vdw_selection_matrix() {
        let plain = InteractionConstants::from_settings(&InteractionSettings::default()).unwrap();
        assert_eq!(
            pick_vdw_kind(&plain, LjCombinationRule::None, LjCombinationRule::None).unwrap(),
            VdwKind::Cutoff
        );
        assert_eq!(
            pick_vdw_kind(&plain, LjCombinationRule::Geometric, LjCombinationRule::None).unwrap(),
            VdwKind::CutoffCombGeom
        );

        let switched = InteractionConstants::from_settings(&InteractionSettings {
            vdw_modifier: VdwModifier::ForceSwitch,
            r_vdw_switch: 0.8,
            ..InteractionSettings::default()
        })
        .unwrap();
        assert_eq!(
            pick_vdw_kind(&switched, LjCombinationRule::Geometric, LjCombinationRule::None)
                .unwrap(),
            VdwKind::ForceSwitch
        );

        let pme = InteractionConstants::from_settings(&InteractionSettings {
            vdw: VdwSetting::Pme,
            ewaldcoeff_lj: 2.0,
            ..InteractionSettings::default()
        })
        .unwrap();
        assert_eq!(
            pick_vdw_kind(&pme, LjCombinationRule::Geometric, LjCombinationRule::Geometric).unwrap(),
            VdwKind::EwaldCombGeom
        );
        assert!(pick_vdw_kind(&pme, LjCombinationRule::None, LjCombinationRule::Geometric).is_err());
        assert!(pick_vdw_kind(&pme, LjCombinationRule::None, LjCombinationRule::None).is_err());
    }

    #[test]
    fn coulomb_table_matches_closed_form() {
        let beta = 3.12_f32;
        let table = build_coulomb_force_table(beta, 1.0).unwrap();
        assert_eq!(table.data[0], 0.0);
        for &r in &[0.2_f32, 0.5, 0.73, 0.99] {
            let b = beta as f64;
            let rf = r as f64;
            let exact = erf(b * rf) / (rf * rf)
                - 2.0 * b * (-b * b * rf * rf).exp() / (PI.sqrt() * rf);
            let got = table.interpolate(r) as f64;
            assert!(
                (got - exact).abs() < 1e-4 * exact.abs().max(1.0),
                "r = {r}: {got} vs {exact}"
            );
        }
    }

    #[test]
    fn lb_tables_agree_with_pair_matrix() {
        // The per-type combination entries must reproduce the pair table
        // through the kernel's sigma/epsilon recombination.
        let params =
            NonbondedParamsHost::from_sigma_epsilon_lb(&[0.3, 0.25], &[0.6, 1.1]).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let ci = params.nbfp_comb[i];
                let cj = params.nbfp_comb[j];
                let sigma = ci.x + cj.x;
                let epsilon = ci.y * cj.y;
                let c6 = epsilon * sigma.powi(6);
                let c12 = c6 * sigma.powi(6);
                let pair = params.nbfp[i * 2 + j];
                assert!((c6 - pair.x).abs() < 1e-4 * pair.x);
                assert!((c12 - pair.y).abs() < 1e-4 * pair.y);
            }
        }
    }
}
