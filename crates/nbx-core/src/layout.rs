//! Cluster geometry and execution-lane configuration shared by the reference
//! and device kernels.
//!
//! One lane group (`LANE_GROUP_SIZE` lanes, laid out as an 8x8 tile with
//! `tidxi` selecting the atom within a cluster and `tidxj` selecting the
//! cluster row) processes exactly one super-cluster. All loop bounds in the
//! kernels are uniform across the group; only the innermost distance checks
//! diverge per lane.

/// Atoms per cluster.
pub const CLUSTER_SIZE: usize = 8;

/// Clusters grouped into one super-cluster.
pub const CLUSTERS_PER_SUPERCLUSTER: usize = 8;

/// j-clusters packed into one cluster-pair entry.
pub const JGROUP_SIZE: usize = 4;

/// Lanes cooperating on one super-cluster.
pub const LANE_GROUP_SIZE: usize = CLUSTER_SIZE * CLUSTER_SIZE;

/// Atoms per super-cluster.
pub const ATOMS_PER_SUPERCLUSTER: usize = CLUSTERS_PER_SUPERCLUSTER * CLUSTER_SIZE;

/// Interaction-mask bits covering all i-clusters of one super-cluster.
pub const SUPERCLUSTER_INTERACTION_MASK: u32 = (1 << CLUSTERS_PER_SUPERCLUSTER) - 1;

/// Number of periodic shift vectors.
pub const NUM_SHIFT_VECTORS: usize = 45;

/// Shift index of the unshifted (central) image.
pub const CENTRAL_SHIFT_INDEX: i32 = 22;

/// Floor for squared interatomic distances, applied before the reciprocal
/// square root so r^-12 cannot overflow single precision.
pub const MIN_DISTANCE_SQUARED: f32 = 3.82e-7;

/// Coordinate written into filler slots of the packed layout. Far enough
/// from any real atom that filler pairs never pass a cutoff check; filler
/// pairs among themselves sit at zero distance and carry zero charge and
/// zero pair parameters, so they contribute exactly nothing.
pub const FILLER_COORDINATE: f32 = -1_000_000.0;

/// Accumulator-slot spreading factors: energies and shift forces are
/// scattered over this many hashed regions (plus region 0, the summation
/// target) to reduce atomic contention between lane groups.
pub const ENERGY_SLOT_MULTIPLIER: usize = 64;
pub const SHIFT_SLOT_MULTIPLIER: usize = 64;

/// Element counts of the accumulator buffers including region 0.
pub const ENERGY_BUFFER_LEN: usize = ENERGY_SLOT_MULTIPLIER + 1;
pub const SHIFT_BUFFER_LEN: usize = NUM_SHIFT_VECTORS * (SHIFT_SLOT_MULTIPLIER + 1);

/// Lane holding the pair (i-atom `tidxi`, j-atom `tidxj`) of the 8x8 tile.
pub fn lane_index(tidxi: usize, tidxj: usize) -> usize {
    tidxj * CLUSTER_SIZE + tidxi
}

/// Hashed energy-accumulator slot for the lane group running list entry
/// `group_index`.
pub fn energy_slot(group_index: usize) -> usize {
    1 + (group_index & (ENERGY_SLOT_MULTIPLIER - 1))
}

/// Hashed shift-force slot for shift vector `shift` accumulated by list
/// entry `group_index`.
pub fn shift_slot(group_index: usize, shift: i32) -> usize {
    NUM_SHIFT_VECTORS * (1 + (group_index & (SHIFT_SLOT_MULTIPLIER - 1))) + shift as usize
}

/// Launch geometry for one device kernel invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelLaunchConfig {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
}

/// Launch geometry of the force kernel: one lane group per pair-list entry.
/// Shared storage holds the preloaded i-atom xq plus either the i-atom type
/// ids or their combination-rule parameters.
pub fn force_kernel_launch_config(num_sci: usize, uses_lj_comb: bool) -> KernelLaunchConfig {
    let xq_bytes = ATOMS_PER_SUPERCLUSTER * 16;
    let param_bytes = ATOMS_PER_SUPERCLUSTER * if uses_lj_comb { 8 } else { 4 };
    KernelLaunchConfig {
        grid: [num_sci as u32, 1, 1],
        block: [CLUSTER_SIZE as u32, CLUSTER_SIZE as u32, 1],
        shared_mem_bytes: (xq_bytes + param_bytes) as u32,
    }
}

/// Launch geometry of the prune-only kernel over `list_part_len` entries.
pub fn prune_kernel_launch_config(list_part_len: usize) -> KernelLaunchConfig {
    KernelLaunchConfig {
        grid: [list_part_len as u32, 1, 1],
        block: [CLUSTER_SIZE as u32, CLUSTER_SIZE as u32, 1],
        shared_mem_bytes: (ATOMS_PER_SUPERCLUSTER * 16) as u32,
    }
}
