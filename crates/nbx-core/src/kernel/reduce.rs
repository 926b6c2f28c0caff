//! Lane-group collectives of the cluster-pair kernels.
//!
//! Every function takes per-lane values for a full lane group of
//! [`LANE_GROUP_SIZE`] lanes, indexed by [`lane_index`]. On a device these
//! are a ballot vote and shuffle-based tree reductions; here the sums run
//! in lane order, which keeps results reproducible across runs.

use crate::layout::{lane_index, CLUSTERS_PER_SUPERCLUSTER, CLUSTER_SIZE, LANE_GROUP_SIZE};
use crate::vec::Float3;

/// Whether any lane of the group raised its flag.
pub fn vote_any(flags: &[bool; LANE_GROUP_SIZE]) -> bool {
    flags.iter().any(|&f| f)
}

/// Folds the per-lane j-force accumulators of one j cluster into the
/// force buffer; lanes sharing a `tidxj` hold partial forces of the same
/// j atom `aj_base + tidxj`.
pub fn reduce_force_j(fcj: &[Float3; LANE_GROUP_SIZE], f: &mut [Float3], aj_base: usize) {
    for tidxj in 0..CLUSTER_SIZE {
        let mut sum = Float3::zero();
        for tidxi in 0..CLUSTER_SIZE {
            sum = sum.add(fcj[lane_index(tidxi, tidxj)]);
        }
        f[aj_base + tidxj] = f[aj_base + tidxj].add(sum);
    }
}

/// Folds the per-lane i-force accumulators of a whole super-cluster into
/// the force buffer and returns the total, which feeds the shift force.
/// Lanes sharing a `tidxi` hold partial forces of atom
/// `(sci * CLUSTERS_PER_SUPERCLUSTER + i) * CLUSTER_SIZE + tidxi`.
pub fn reduce_force_i(
    fci: &[[Float3; CLUSTERS_PER_SUPERCLUSTER]; LANE_GROUP_SIZE],
    f: &mut [Float3],
    sci: usize,
) -> Float3 {
    let mut total = Float3::zero();
    for i in 0..CLUSTERS_PER_SUPERCLUSTER {
        let ai_base = (sci * CLUSTERS_PER_SUPERCLUSTER + i) * CLUSTER_SIZE;
        for tidxi in 0..CLUSTER_SIZE {
            let mut sum = Float3::zero();
            for tidxj in 0..CLUSTER_SIZE {
                sum = sum.add(fci[lane_index(tidxi, tidxj)][i]);
            }
            f[ai_base + tidxi] = f[ai_base + tidxi].add(sum);
            total = total.add(sum);
        }
    }
    total
}

/// Sums one per-lane energy accumulator over the group.
pub fn reduce_energy(values: &[f32; LANE_GROUP_SIZE]) -> f32 {
    values.iter().sum()
}
