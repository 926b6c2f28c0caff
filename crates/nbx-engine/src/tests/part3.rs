#[test]
fn dynamic_pruning_preserves_forces() {
    let settings = cutoff_settings(1.0);
    let mut rng = StdRng::seed_from_u64(17);
    let mut real = Vec::new();
    for k in 0..16 {
        let pos = Float3::new(
            0.14 * (k % 4) as f32 + rng.gen_range(-0.02..0.02),
            0.14 * ((k / 4) % 4) as f32 + rng.gen_range(-0.02..0.02),
            0.1 + rng.gen_range(-0.02..0.02),
        );
        let q = if k % 2 == 0 { 0.3 } else { -0.3 };
        real.push((pos, q));
    }
    // One candidate between the cut-off and the outer list radius.
    real[15].0 = Float3::new(1.15, 0.05, 0.1);

    let plain_params = PairlistParams {
        rlist_outer: 1.3,
        rlist_inner: 1.0,
        use_dynamic_pruning: false,
    };
    let pruning_params = PairlistParams {
        use_dynamic_pruning: true,
        ..plain_params
    };

    let mut plain =
        NonbondedGpu::new(DeviceSpec::Host, &settings, plain_params, &no_lj(), false).unwrap();
    let xq = prime_local(&mut plain, &real, 0..2);
    let reference = step_local(&mut plain, &xq, &forces_only());

    let mut pruning =
        NonbondedGpu::new(DeviceSpec::Host, &settings, pruning_params, &no_lj(), false).unwrap();
    let xq = prime_local(&mut pruning, &real, 0..2);
    let out = step_local(&mut pruning, &xq, &forces_only());

    for slot in 0..16 {
        assert_close(out.forces[slot].x, reference.forces[slot].x, 1e-5);
        assert_close(out.forces[slot].y, reference.forces[slot].y, 1e-5);
        assert_close(out.forces[slot].z, reference.forces[slot].z, 1e-5);
    }
    if pruning.timing_enabled() {
        assert_eq!(pruning.timings().local.prune_kernel.count, 1);
        assert_eq!(plain.timings().local.prune_kernel.count, 0);
    }
}

#[test]
fn rolling_prune_scheduling_and_cadence() {
    let settings = cutoff_settings(1.0);
    let params = PairlistParams {
        rlist_outer: 1.3,
        rlist_inner: 1.0,
        use_dynamic_pruning: true,
    };
    let mut engine =
        NonbondedGpu::new(DeviceSpec::Host, &settings, params, &no_lj(), false).unwrap();
    let real = [
        (Float3::zero(), 1.0),
        (Float3::new(0.6, 0.0, 0.0), -1.0),
    ];
    let xq = prime_local(&mut engine, &real, 0..1);
    let reference = step_local(&mut engine, &xq, &forces_only());

    // The first rolling call after a rebuild may pick any cadence; later
    // calls must keep it until the next rebuild.
    engine.launch_prune_kernel(InteractionLocality::Local, 2).unwrap();
    engine.launch_prune_kernel(InteractionLocality::Local, 2).unwrap();
    let err = engine
        .launch_prune_kernel(InteractionLocality::Local, 3)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));

    let out = step_local(&mut engine, &xq, &forces_only());
    assert_close(out.forces[0].x, reference.forces[0].x, 1e-6);

    // A fresh list resets the cadence.
    engine
        .init_pairlist(&diagonal_list(0..1), InteractionLocality::Local)
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    engine.launch_prune_kernel(InteractionLocality::Local, 3).unwrap();
    engine.launch_prune_kernel(InteractionLocality::Local, 3).unwrap();
    let err = engine
        .launch_prune_kernel(InteractionLocality::Local, 2)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
}

#[test]
fn self_energy_is_additive_across_launches() {
    let settings = rf_settings(2.0);
    let ic = InteractionConstants::from_settings(&settings).unwrap();
    let mut engine = build(&settings, &no_lj(), 2.0);
    let real = [(Float3::zero(), 1.0)];
    let xq = prime_local(&mut engine, &real, 0..1);
    let workload = full_outputs();

    let first = step_local(&mut engine, &xq, &workload);
    let expected = -0.5 * ic.reaction_field_shift * ic.epsfac;
    assert_close(first.e_elec, expected, 1e-4);

    // Launch again without clearing; the accumulators keep integrating.
    engine
        .launch_force_kernel(InteractionLocality::Local, &workload)
        .unwrap();
    engine.launch_copy_back(AtomLocality::Local, &workload).unwrap();
    let second = engine
        .wait_and_collect(AtomLocality::Local, &workload)
        .unwrap();
    assert_close(second.e_elec, 2.0 * expected, 1e-4);
}

#[test]
fn atom_data_growth_preserves_parameter_tables() {
    let settings = cutoff_settings(2.0);
    let mut engine = build(&settings, &lj_only(4.0, 4.0), 2.0);
    let real = [
        (Float3::zero(), 0.0),
        (Float3::new(1.0, 0.0, 0.0), 0.0),
    ];
    let xq = prime_local(&mut engine, &real, 0..1);
    let reference = step_local(&mut engine, &xq, &forces_only());
    assert_close(reference.forces[0].x, -24.0, 1e-4);

    // Grow to two super-clusters and run the same pair again.
    let grown = 2 * ATOMS_PER_SUPERCLUSTER;
    engine.init_atom_data(&type_atom_data(grown, grown)).unwrap();
    engine
        .init_pairlist(&diagonal_list(0..1), InteractionLocality::Local)
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    let xq = packed_xq(&real, grown);
    let out = step_local(&mut engine, &xq, &forces_only());
    assert_eq!(out.forces.len(), grown);
    assert_close(out.forces[0].x, reference.forces[0].x, 1e-6);

    // Shrinking back reuses the high-water storage.
    engine
        .init_atom_data(&type_atom_data(
            ATOMS_PER_SUPERCLUSTER,
            ATOMS_PER_SUPERCLUSTER,
        ))
        .unwrap();
    engine
        .init_pairlist(&diagonal_list(0..1), InteractionLocality::Local)
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    let xq = packed_xq(&real, ATOMS_PER_SUPERCLUSTER);
    let out = step_local(&mut engine, &xq, &forces_only());
    assert_eq!(out.forces.len(), ATOMS_PER_SUPERCLUSTER);
    assert_close(out.forces[0].x, reference.forces[0].x, 1e-6);
}

#[test]
fn prune_launch_argument_checks() {
    let settings = cutoff_settings(1.0);
    let mut engine = build(&settings, &no_lj(), 1.0);
    let err = engine
        .launch_prune_kernel(InteractionLocality::Local, 0)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    // Without list work the launch is a no-op.
    engine.launch_prune_kernel(InteractionLocality::Local, 4).unwrap();
}
