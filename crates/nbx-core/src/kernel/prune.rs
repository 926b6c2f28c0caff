//! List pruning between evaluation passes.
//!
//! A freshly built list covers the outer radius. The first pass over a
//! fresh list tightens the build-time masks to the outer radius, saves
//! them aside and leaves the working masks pruned to the inner radius.
//! Later rolling passes redo the inner-radius check against the saved
//! outer masks, so pairs drifting across the inner boundary in either
//! direction are picked up without a rebuild.

use crate::layout::{
    lane_index, ATOMS_PER_SUPERCLUSTER, CLUSTERS_PER_SUPERCLUSTER, CLUSTER_SIZE, JGROUP_SIZE,
    LANE_GROUP_SIZE, SUPERCLUSTER_INTERACTION_MASK,
};
use crate::pairlist::{Cj4Entry, SciEntry};
use crate::vec::Float3;

use super::reduce;
use super::{AtomDataView, KernelConsts};

/// Prunes the working interaction masks of every `num_parts`-th list entry
/// starting at `part`; `saved_imask` holds one outer-radius mask per cj4
/// entry and must span the whole cj4 table. `num_parts` is at least 1.
#[allow(clippy::too_many_arguments)]
pub fn prune_kernel(
    sci_entries: &[SciEntry],
    cj4: &mut [Cj4Entry],
    saved_imask: &mut [u32],
    atoms: &AtomDataView<'_>,
    consts: &KernelConsts,
    have_fresh_list: bool,
    num_parts: usize,
    part: usize,
) {
    for entry in sci_entries.iter().skip(part).step_by(num_parts) {
        let sci = entry.sci as usize;
        let shift_vec = atoms.shift_vec[entry.shift as usize];

        let mut xib = [Float3::zero(); ATOMS_PER_SUPERCLUSTER];
        for cluster in 0..CLUSTERS_PER_SUPERCLUSTER {
            for row in 0..CLUSTER_SIZE {
                let ai = (sci * CLUSTERS_PER_SUPERCLUSTER + cluster) * CLUSTER_SIZE + row;
                xib[cluster * CLUSTER_SIZE + row] =
                    atoms.xq[ai].xyz().add(shift_vec).neg();
            }
        }

        for j4 in entry.cj4_range() {
            let candidates = if have_fresh_list {
                cj4[j4].imask
            } else {
                saved_imask[j4]
            };
            let mut outer_mask = candidates;
            let mut inner_mask = 0_u32;

            for jm in 0..JGROUP_SIZE {
                if candidates & (SUPERCLUSTER_INTERACTION_MASK << (jm * CLUSTERS_PER_SUPERCLUSTER))
                    == 0
                {
                    continue;
                }
                let aj_base = cj4[j4].cj[jm] as usize * CLUSTER_SIZE;
                for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                    let bit = Cj4Entry::interaction_bit(i, jm);
                    if candidates & bit == 0 {
                        continue;
                    }
                    let mut within_outer = [false; LANE_GROUP_SIZE];
                    let mut within_inner = [false; LANE_GROUP_SIZE];
                    for tidxj in 0..CLUSTER_SIZE {
                        let xj = atoms.xq[aj_base + tidxj].xyz();
                        for tidxi in 0..CLUSTER_SIZE {
                            let lane = lane_index(tidxi, tidxj);
                            let r2 = xib[i * CLUSTER_SIZE + tidxi].add(xj).norm2();
                            within_outer[lane] = r2 < consts.rlist_outer_sq;
                            within_inner[lane] = r2 < consts.rlist_inner_sq;
                        }
                    }
                    if have_fresh_list && !reduce::vote_any(&within_outer) {
                        outer_mask &= !bit;
                    }
                    if reduce::vote_any(&within_inner) {
                        inner_mask |= bit;
                    }
                }
            }

            if have_fresh_list {
                saved_imask[j4] = outer_mask;
            }
            cj4[j4].imask = inner_mask;
        }
    }
}
