use super::*;

use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use nbx_core::layout::{
    lane_index, ATOMS_PER_SUPERCLUSTER, CENTRAL_SHIFT_INDEX, CLUSTERS_PER_SUPERCLUSTER,
    CLUSTER_SIZE, JGROUP_SIZE, NUM_SHIFT_VECTORS,
};
use nbx_core::{
    Cj4Entry, CoulombSetting, ElecKind, ExclEntry, Float2, Float3, Float4, InteractionConstants,
    InteractionSettings, LjCombinationRule, NonbondedParamsHost, PairListHost, PairlistParams,
    SciEntry, VdwKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::function::erf::erfc;

// Engines that pick Ewald kernels read the override environment variables,
// so every test that builds one (or mutates the variables) serializes here.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn assert_close(value: f32, expected: f32, rel: f32) {
    assert!(
        (value - expected).abs() <= rel * expected.abs().max(1.0),
        "{value} vs {expected}"
    );
}

fn cutoff_settings(rc: f32) -> InteractionSettings {
    InteractionSettings {
        r_coulomb: rc,
        r_vdw: rc,
        ..InteractionSettings::default()
    }
}

fn rf_settings(rc: f32) -> InteractionSettings {
    InteractionSettings {
        coulomb: CoulombSetting::ReactionField,
        epsilon_rf: 0.0,
        ..cutoff_settings(rc)
    }
}

fn ewald_settings(rc: f32, beta: f32) -> InteractionSettings {
    InteractionSettings {
        coulomb: CoulombSetting::Ewald,
        ewald_beta: beta,
        ..cutoff_settings(rc)
    }
}

fn list_params(rlist: f32) -> PairlistParams {
    PairlistParams {
        rlist_outer: rlist + 0.3,
        rlist_inner: rlist,
        use_dynamic_pruning: false,
    }
}

fn no_lj() -> NonbondedParamsHost {
    NonbondedParamsHost::new(
        1,
        vec![Float2::default()],
        Vec::new(),
        LjCombinationRule::None,
        LjCombinationRule::None,
    )
    .unwrap()
}

fn lj_only(c6: f32, c12: f32) -> NonbondedParamsHost {
    NonbondedParamsHost::new(
        1,
        vec![Float2::new(6.0 * c6, 12.0 * c12)],
        Vec::new(),
        LjCombinationRule::None,
        LjCombinationRule::None,
    )
    .unwrap()
}

fn build(
    settings: &InteractionSettings,
    params: &NonbondedParamsHost,
    rlist: f32,
) -> NonbondedGpu {
    NonbondedGpu::new(DeviceSpec::Host, settings, list_params(rlist), params, false).unwrap()
}

/// Packs real atoms into the leading slots and parks the rest far away
/// with zero charge.
fn packed_xq(real: &[(Float3, f32)], num_slots: usize) -> Vec<Float4> {
    let mut xq = Vec::with_capacity(num_slots);
    for &(pos, q) in real {
        xq.push(Float4::from_xyz_w(pos, q));
    }
    for k in real.len()..num_slots {
        let filler = Float3::new(700.0 + 3.0 * k as f32, 550.0, 420.0 + k as f32);
        xq.push(Float4::from_xyz_w(filler, 0.0));
    }
    xq
}

/// A central-image list covering the requested cluster range against
/// super-cluster zero, upper triangle only, with per-entry exclusion words
/// masking the diagonal like the list builder does.
fn diagonal_list(clusters: Range<usize>) -> PairListHost {
    let cj_list: Vec<usize> = clusters.collect();
    let n_j4 = (cj_list.len() + JGROUP_SIZE - 1) / JGROUP_SIZE;
    let mut list = PairListHost::new();
    for g in 0..n_j4 {
        let mut entry = Cj4Entry::default();
        for jm in 0..JGROUP_SIZE {
            let Some(&cj) = cj_list.get(g * JGROUP_SIZE + jm) else {
                continue;
            };
            entry.cj[jm] = cj as i32;
            for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                if cj >= i {
                    entry.imask |= Cj4Entry::interaction_bit(i, jm);
                }
            }
        }
        let mut words = ExclEntry::interaction_all();
        for tidxj in 0..CLUSTER_SIZE {
            for tidxi in 0..CLUSTER_SIZE {
                for jm in 0..JGROUP_SIZE {
                    for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                        let bit = Cj4Entry::interaction_bit(i, jm);
                        if entry.imask & bit != 0 && entry.cj[jm] == i as i32 && tidxj <= tidxi {
                            words.pair[lane_index(tidxi, tidxj)] &= !bit;
                        }
                    }
                }
            }
        }
        entry.excl_index = list.excl.len() as i32;
        list.excl.push(words);
        list.cj4.push(entry);
    }
    list.sci.push(SciEntry {
        sci: 0,
        shift: CENTRAL_SHIFT_INDEX,
        cj4_start: 0,
        cj4_length: list.cj4.len() as i32,
    });
    list
}

/// A single entry pairing one i-cluster of super-cluster zero against one
/// j-cluster under the given shift, all lanes allowed.
fn cross_pair_list(shift: i32, ci: usize, cj: usize) -> PairListHost {
    let mut list = PairListHost::new();
    let mut entry = Cj4Entry::default();
    entry.cj[0] = cj as i32;
    entry.imask = Cj4Entry::interaction_bit(ci, 0);
    list.cj4.push(entry);
    list.sci.push(SciEntry {
        sci: 0,
        shift,
        cj4_start: 0,
        cj4_length: 1,
    });
    list
}

fn type_atom_data(num_local: usize, num_total: usize) -> AtomDataHost {
    AtomDataHost {
        num_local_slots: num_local,
        num_total_slots: num_total,
        atom_types: vec![0; num_total],
        lj_comb: Vec::new(),
    }
}

fn prime_with_list(
    engine: &mut NonbondedGpu,
    real: &[(Float3, f32)],
    list: &PairListHost,
) -> Vec<Float4> {
    let slots = ATOMS_PER_SUPERCLUSTER;
    engine.init_atom_data(&type_atom_data(slots, slots)).unwrap();
    engine
        .upload_shift_vectors(&vec![Float3::zero(); NUM_SHIFT_VECTORS], false)
        .unwrap();
    engine.init_pairlist(list, InteractionLocality::Local).unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    packed_xq(real, slots)
}

fn prime_local(
    engine: &mut NonbondedGpu,
    real: &[(Float3, f32)],
    clusters: Range<usize>,
) -> Vec<Float4> {
    prime_with_list(engine, real, &diagonal_list(clusters))
}

fn prime_comb(engine: &mut NonbondedGpu, comb: Float2, clusters: Range<usize>) {
    let slots = ATOMS_PER_SUPERCLUSTER;
    engine
        .init_atom_data(&AtomDataHost {
            num_local_slots: slots,
            num_total_slots: slots,
            atom_types: Vec::new(),
            lj_comb: vec![comb; slots],
        })
        .unwrap();
    engine
        .upload_shift_vectors(&vec![Float3::zero(); NUM_SHIFT_VECTORS], false)
        .unwrap();
    engine
        .init_pairlist(&diagonal_list(clusters), InteractionLocality::Local)
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
}

/// Drives one local-only step and collects the outputs.
fn step_local(engine: &mut NonbondedGpu, xq: &[Float4], workload: &StepWorkload) -> StepOutputs {
    engine.clear_outputs(workload).unwrap();
    engine.copy_xq_to_device(AtomLocality::Local, xq).unwrap();
    engine
        .launch_force_kernel(InteractionLocality::Local, workload)
        .unwrap();
    engine.launch_copy_back(AtomLocality::Local, workload).unwrap();
    engine.wait_and_collect(AtomLocality::Local, workload).unwrap()
}

fn forces_only() -> StepWorkload {
    StepWorkload::default()
}

fn full_outputs() -> StepWorkload {
    StepWorkload {
        compute_energies: true,
        compute_virial: true,
        use_gpu_f_buffer_ops: false,
    }
}

/// Coulomb force on atom `i` from atom `j`, in kernel units.
fn coulomb_force_on(epsfac: f32, qi: f32, qj: f32, ri: Float3, rj: Float3) -> Float3 {
    let rv = ri.sub(rj);
    let r2 = rv.norm2();
    rv.scale(epsfac * qi * qj / (r2 * r2.sqrt()))
}

include!("part1.rs");
include!("part2.rs");
include!("part3.rs");
include!("part4.rs");
