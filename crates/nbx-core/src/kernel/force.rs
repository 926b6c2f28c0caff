//! The cluster-pair force kernel.
//!
//! One outer iteration works through one pair-list entry the way a lane
//! group does on a device: i-side data is preloaded once per entry with
//! positions shifted and negated so the pair vector is a plain sum, pair
//! state lives in lane-indexed arrays and the j/i force folds go through
//! [`reduce`]. Energies and shift forces land in the entry's hashed
//! accumulation slots and are summed into their canonical slots later, on
//! the host side of a download.

use crate::layout::{
    energy_slot, lane_index, shift_slot, ATOMS_PER_SUPERCLUSTER, CENTRAL_SHIFT_INDEX,
    CLUSTERS_PER_SUPERCLUSTER, CLUSTER_SIZE, JGROUP_SIZE, LANE_GROUP_SIZE, MIN_DISTANCE_SQUARED,
    SUPERCLUSTER_INTERACTION_MASK,
};
use crate::pairlist::{Cj4Entry, ExclEntry, SciEntry};
use crate::vec::{Float3, Float4};

use super::models::{ElecModel, VdwModel};
use super::reduce;
use super::{AtomDataView, ForceKernelFlags, ForceOutputs, KernelConsts, PairTables};

/// Evaluates the pair forces of every list entry, with optional energy and
/// shift-force accumulation and an optional in-pass prune of the
/// interaction masks against the outer list radius.
#[allow(clippy::too_many_arguments)]
pub fn force_kernel<E: ElecModel, V: VdwModel>(
    sci_entries: &[SciEntry],
    cj4: &mut [Cj4Entry],
    excl: &[ExclEntry],
    atoms: &AtomDataView<'_>,
    consts: &KernelConsts,
    tables: &PairTables<'_>,
    coulomb_tab: &[f32],
    out: &mut ForceOutputs<'_>,
    flags: ForceKernelFlags,
) {
    // Excluded in-range pairs only run through the pair loop when a flavor
    // carries correction terms for them.
    let exclusion_forces = E::exclusion_forces(flags.calc_energies) || V::IS_LJ_EWALD;

    for (entry_index, entry) in sci_entries.iter().enumerate() {
        let sci = entry.sci as usize;
        let range = entry.cj4_range();
        let shift_vec = atoms.shift_vec[entry.shift as usize];

        let mut xqib = [Float4::default(); ATOMS_PER_SUPERCLUSTER];
        let mut param_ib = [V::AtomParam::default(); ATOMS_PER_SUPERCLUSTER];
        for cluster in 0..CLUSTERS_PER_SUPERCLUSTER {
            for row in 0..CLUSTER_SIZE {
                let ai = (sci * CLUSTERS_PER_SUPERCLUSTER + cluster) * CLUSTER_SIZE + row;
                let xq = atoms.xq[ai];
                let slot = cluster * CLUSTER_SIZE + row;
                xqib[slot] =
                    Float4::from_xyz_w(xq.xyz().add(shift_vec).neg(), xq.w * consts.epsfac);
                param_ib[slot] = V::atom_param(atoms, ai);
            }
        }

        let mut fci_buf = [[Float3::zero(); CLUSTERS_PER_SUPERCLUSTER]; LANE_GROUP_SIZE];
        let mut e_lj_acc = [0.0_f32; LANE_GROUP_SIZE];
        let mut e_el_acc = [0.0_f32; LANE_GROUP_SIZE];

        // A diagonal entry of the home box leads with its own super-cluster
        // as first j-cluster; that entry contributes the charge and LJ-PME
        // self-interaction energies exactly once.
        if flags.calc_energies
            && exclusion_forces
            && entry.shift == CENTRAL_SHIFT_INDEX
            && !range.is_empty()
            && cj4[range.start].cj[0] == (sci * CLUSTERS_PER_SUPERCLUSTER) as i32
        {
            // The preloaded charges carry epsfac, so the squared sum is
            // corrected by one factor; the division spreads the term over
            // the lanes sharing a tidxi.
            let e_el_scale = E::self_energy_prefactor(consts) / (consts.epsfac * CLUSTER_SIZE as f32);
            let e_lj_scale = 0.5 * (1.0 / 6.0) * consts.lje_coeff6_6 / CLUSTER_SIZE as f32;
            for tidxj in 0..CLUSTER_SIZE {
                for tidxi in 0..CLUSTER_SIZE {
                    let mut e_el = 0.0_f32;
                    let mut e_lj = 0.0_f32;
                    for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                        let qi = xqib[i * CLUSTER_SIZE + tidxi].w;
                        e_el += qi * qi;
                        if V::IS_LJ_EWALD {
                            let ti = atoms.atom_types
                                [(sci * CLUSTERS_PER_SUPERCLUSTER + i) * CLUSTER_SIZE + tidxi];
                            e_lj += tables.pair(ti, ti).x;
                        }
                    }
                    let lane = lane_index(tidxi, tidxj);
                    e_el_acc[lane] += e_el * e_el_scale;
                    if V::IS_LJ_EWALD {
                        e_lj_acc[lane] += e_lj * e_lj_scale;
                    }
                }
            }
        }

        for j4 in range.clone() {
            let mut imask = cj4[j4].imask;
            if imask == 0 && !flags.prune {
                continue;
            }
            let wexcl = &excl[cj4[j4].excl_index as usize].pair;

            for jm in 0..JGROUP_SIZE {
                if imask & (SUPERCLUSTER_INTERACTION_MASK << (jm * CLUSTERS_PER_SUPERCLUSTER)) == 0
                {
                    continue;
                }
                let cj = cj4[j4].cj[jm];
                let aj_base = cj as usize * CLUSTER_SIZE;
                let mut fcj_buf = [Float3::zero(); LANE_GROUP_SIZE];

                for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                    let mask_ji = Cj4Entry::interaction_bit(i, jm);
                    if imask & mask_ji == 0 {
                        continue;
                    }
                    let ci = (sci * CLUSTERS_PER_SUPERCLUSTER + i) as i32;

                    let mut rv = [Float3::zero(); LANE_GROUP_SIZE];
                    let mut r2 = [0.0_f32; LANE_GROUP_SIZE];
                    for tidxj in 0..CLUSTER_SIZE {
                        let xj = atoms.xq[aj_base + tidxj].xyz();
                        for tidxi in 0..CLUSTER_SIZE {
                            let lane = lane_index(tidxi, tidxj);
                            rv[lane] = xqib[i * CLUSTER_SIZE + tidxi].xyz().add(xj);
                            r2[lane] = rv[lane].norm2();
                        }
                    }

                    // The prune vote comes before the distance clamp and
                    // sees every pair; the pair still interacts normally
                    // within this pass even when its bit is dropped.
                    if flags.prune {
                        let mut in_range = [false; LANE_GROUP_SIZE];
                        for lane in 0..LANE_GROUP_SIZE {
                            in_range[lane] = r2[lane] < consts.rlist_outer_sq;
                        }
                        if !reduce::vote_any(&in_range) {
                            imask &= !mask_ji;
                        }
                    }

                    for tidxj in 0..CLUSTER_SIZE {
                        let aj = aj_base + tidxj;
                        let qj = atoms.xq[aj].w;
                        let param_j = V::atom_param(atoms, aj);
                        for tidxi in 0..CLUSTER_SIZE {
                            let lane = lane_index(tidxi, tidxj);
                            let int_bit = ((wexcl[lane]
                                >> (jm * CLUSTERS_PER_SUPERCLUSTER + i))
                                & 1) as f32;
                            // On the diagonal every atom pair must count
                            // once, so lanes at or below it stand down.
                            let non_self =
                                !(entry.shift == CENTRAL_SHIFT_INDEX && tidxj <= tidxi);
                            let within = r2[lane] < consts.rcoulomb_sq;
                            let active = if exclusion_forces {
                                within && (non_self || ci != cj)
                            } else {
                                within && int_bit != 0.0
                            };
                            if !active {
                                continue;
                            }

                            let r2_pair = r2[lane].max(MIN_DISTANCE_SQUARED);
                            let inv_r = 1.0 / r2_pair.sqrt();
                            let inv_r2 = inv_r * inv_r;

                            let (mut f_invr, mut e_lj_p) = V::eval(
                                consts,
                                tables,
                                param_ib[i * CLUSTER_SIZE + tidxi],
                                param_j,
                                int_bit,
                                r2_pair,
                                inv_r,
                                inv_r2,
                                flags.calc_energies,
                            );
                            if E::VDW_CUTOFF_CHECK {
                                let vdw_in_range =
                                    if r2_pair < consts.rvdw_sq { 1.0 } else { 0.0 };
                                f_invr *= vdw_in_range;
                                e_lj_p *= vdw_in_range;
                            }

                            let qi_qj = xqib[i * CLUSTER_SIZE + tidxi].w * qj;
                            f_invr += E::force(
                                consts, coulomb_tab, qi_qj, int_bit, r2_pair, inv_r, inv_r2,
                            );
                            if flags.calc_energies {
                                e_lj_acc[lane] += e_lj_p;
                                e_el_acc[lane] +=
                                    E::energy(consts, qi_qj, int_bit, r2_pair, inv_r);
                            }

                            let f_ij = rv[lane].scale(f_invr);
                            fcj_buf[lane] = fcj_buf[lane].add(f_ij);
                            fci_buf[lane][i] = fci_buf[lane][i].sub(f_ij);
                        }
                    }
                }

                reduce::reduce_force_j(&fcj_buf, out.f, aj_base);
            }

            if flags.prune {
                cj4[j4].imask = imask;
            }
        }

        let entry_total = reduce::reduce_force_i(&fci_buf, out.f, sci);
        if flags.calc_shift_forces && entry.shift != CENTRAL_SHIFT_INDEX {
            let slot = shift_slot(entry_index, entry.shift);
            out.fshift[slot] = out.fshift[slot].add(entry_total);
        }
        if flags.calc_energies {
            let slot = energy_slot(entry_index);
            out.e_lj[slot] += reduce::reduce_energy(&e_lj_acc);
            out.e_el[slot] += reduce::reduce_energy(&e_el_acc);
        }
    }
}
