//! Compressed cluster-pair list as produced by the external grid/list
//! builder: a flat array of super-cluster work items, packed groups of four
//! j-clusters with per-pair interaction bits, and a table of per-lane
//! exclusion words.

use crate::error::{CoreError, CoreResult};
use crate::layout::{
    CLUSTERS_PER_SUPERCLUSTER, CLUSTER_SIZE, JGROUP_SIZE, LANE_GROUP_SIZE, NUM_SHIFT_VECTORS,
};

/// One super-cluster work item: which super-cluster, its periodic shift and
/// the half-open range of cluster-pair entries assigned to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SciEntry {
    pub sci: i32,
    pub shift: i32,
    pub cj4_start: i32,
    pub cj4_length: i32,
}

impl SciEntry {
    pub fn cj4_range(&self) -> std::ops::Range<usize> {
        let start = self.cj4_start as usize;
        start..start + self.cj4_length as usize
    }
}

/// Four packed j-clusters: indices, one interaction bit per
/// (i-cluster, j-in-group) pair and the exclusion-table entry shared by the
/// lane group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Cj4Entry {
    pub cj: [i32; JGROUP_SIZE],
    pub imask: u32,
    pub excl_index: i32,
}

impl Cj4Entry {
    /// Interaction bit for i-cluster `i` against the `jm`-th j-cluster of
    /// this entry.
    pub fn interaction_bit(i: usize, jm: usize) -> u32 {
        1 << (jm * CLUSTERS_PER_SUPERCLUSTER + i)
    }
}

/// Per-lane exclusion words; bit `jm * CLUSTERS_PER_SUPERCLUSTER + i` of
/// lane (i-atom, j-atom)'s word masks that atom pair against i-cluster `i`
/// of the `jm`-th j-cluster. The bit layout must match the kernel loop
/// order exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ExclEntry {
    pub pair: [u32; LANE_GROUP_SIZE],
}

impl ExclEntry {
    /// Entry with every interaction allowed; by convention the first entry
    /// of the exclusion table so that cluster pairs without exclusions can
    /// all reference index 0.
    pub fn interaction_all() -> Self {
        Self {
            pair: [u32::MAX; LANE_GROUP_SIZE],
        }
    }

    pub fn none_allowed() -> Self {
        Self {
            pair: [0; LANE_GROUP_SIZE],
        }
    }
}

impl Default for ExclEntry {
    fn default() -> Self {
        Self::interaction_all()
    }
}

/// List-builder parameters the kernels depend on: the outer radius the list
/// was built for, the inner radius pruning reduces it to, and whether a
/// rolling pruning schedule runs between rebuilds.
#[derive(Clone, Copy, Debug)]
pub struct PairlistParams {
    pub rlist_outer: f32,
    pub rlist_inner: f32,
    pub use_dynamic_pruning: bool,
}

/// A finalized pair list for one locality, handed over by the list builder.
#[derive(Clone, Debug, Default)]
pub struct PairListHost {
    pub sci: Vec<SciEntry>,
    pub cj4: Vec<Cj4Entry>,
    pub excl: Vec<ExclEntry>,
    /// Atoms per cluster used when the list was built; must match
    /// [`CLUSTER_SIZE`] and stay constant across rebuilds.
    pub atoms_per_cluster: usize,
}

impl PairListHost {
    pub fn new() -> Self {
        Self {
            sci: Vec::new(),
            cj4: Vec::new(),
            excl: vec![ExclEntry::interaction_all()],
            atoms_per_cluster: CLUSTER_SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sci.is_empty()
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.atoms_per_cluster != CLUSTER_SIZE {
            return Err(CoreError::Mismatch(format!(
                "pair list built for {} atoms per cluster, kernels expect {}",
                self.atoms_per_cluster, CLUSTER_SIZE
            )));
        }
        for entry in &self.sci {
            if entry.shift < 0 || entry.shift >= NUM_SHIFT_VECTORS as i32 {
                return Err(CoreError::Mismatch(format!(
                    "shift index {} out of range",
                    entry.shift
                )));
            }
            let range = entry.cj4_range();
            if range.end > self.cj4.len() {
                return Err(CoreError::Mismatch(format!(
                    "sci entry references cj4 range {:?} beyond table of {}",
                    range,
                    self.cj4.len()
                )));
            }
        }
        for entry in &self.cj4 {
            if entry.excl_index < 0 || entry.excl_index as usize >= self.excl.len() {
                return Err(CoreError::Mismatch(format!(
                    "exclusion index {} beyond table of {}",
                    entry.excl_index,
                    self.excl.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CENTRAL_SHIFT_INDEX;

    #[test]
    fn validate_rejects_foreign_cluster_size() {
        let mut list = PairListHost::new();
        list.atoms_per_cluster = 4;
        assert!(list.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_ranges() {
        let mut list = PairListHost::new();
        list.sci.push(SciEntry {
            sci: 0,
            shift: CENTRAL_SHIFT_INDEX,
            cj4_start: 0,
            cj4_length: 2,
        });
        list.cj4.push(Cj4Entry::default());
        assert!(list.validate().is_err());
        list.cj4.push(Cj4Entry::default());
        assert!(list.validate().is_ok());
    }

    #[test]
    fn interaction_bit_layout_matches_mask_width() {
        assert_eq!(Cj4Entry::interaction_bit(0, 0), 1);
        assert_eq!(Cj4Entry::interaction_bit(7, 3), 1 << 31);
    }
}
