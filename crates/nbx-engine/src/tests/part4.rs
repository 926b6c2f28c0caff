#[test]
fn two_stream_step_combines_local_and_nonlocal_forces() {
    let settings = cutoff_settings(2.0);
    let ic = InteractionConstants::from_settings(&settings).unwrap();
    let mut engine =
        NonbondedGpu::new(DeviceSpec::Host, &settings, list_params(2.0), &no_lj(), true).unwrap();
    assert!(engine.have_nonlocal_domain());

    let slots = 2 * ATOMS_PER_SUPERCLUSTER;
    let a = Float3::zero();
    let b = Float3::new(1.2, 0.0, 0.0);
    let c = Float3::new(0.0, 0.0, 1.0);
    let (qa, qb, qc) = (1.0, -1.0, 1.0);

    engine
        .init_atom_data(&type_atom_data(ATOMS_PER_SUPERCLUSTER, slots))
        .unwrap();
    engine
        .upload_shift_vectors(&vec![Float3::zero(); NUM_SHIFT_VECTORS], false)
        .unwrap();
    engine
        .init_pairlist(&diagonal_list(0..1), InteractionLocality::Local)
        .unwrap();
    engine
        .init_pairlist(
            &cross_pair_list(CENTRAL_SHIFT_INDEX, 0, CLUSTERS_PER_SUPERCLUSTER),
            InteractionLocality::NonLocal,
        )
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    engine.setup_short_range_work(InteractionLocality::NonLocal, false);

    let mut xq = packed_xq(&[(a, qa), (b, qb)], slots);
    xq[ATOMS_PER_SUPERCLUSTER] = Float4::from_xyz_w(c, qc);

    let workload = forces_only();
    engine.clear_outputs(&workload).unwrap();
    engine.copy_xq_to_device(AtomLocality::Local, &xq).unwrap();
    engine.copy_xq_to_device(AtomLocality::NonLocal, &xq).unwrap();
    engine
        .launch_force_kernel(InteractionLocality::Local, &workload)
        .unwrap();
    engine
        .launch_force_kernel(InteractionLocality::NonLocal, &workload)
        .unwrap();
    engine
        .launch_copy_back(AtomLocality::NonLocal, &workload)
        .unwrap();
    engine.launch_copy_back(AtomLocality::Local, &workload).unwrap();
    let nonlocal = engine
        .wait_and_collect(AtomLocality::NonLocal, &workload)
        .unwrap();
    let local = engine
        .wait_and_collect(AtomLocality::Local, &workload)
        .unwrap();

    let expect_a = coulomb_force_on(ic.epsfac, qa, qb, a, b)
        .add(coulomb_force_on(ic.epsfac, qa, qc, a, c));
    let expect_b = coulomb_force_on(ic.epsfac, qb, qa, b, a)
        .add(coulomb_force_on(ic.epsfac, qb, qc, b, c));
    let expect_c = coulomb_force_on(ic.epsfac, qc, qa, c, a)
        .add(coulomb_force_on(ic.epsfac, qc, qb, c, b));

    assert_eq!(local.forces.len(), ATOMS_PER_SUPERCLUSTER);
    assert_eq!(nonlocal.forces.len(), ATOMS_PER_SUPERCLUSTER);
    assert_close(local.forces[0].x, expect_a.x, 2e-4);
    assert_close(local.forces[0].z, expect_a.z, 2e-4);
    assert_close(local.forces[1].x, expect_b.x, 2e-4);
    assert_close(local.forces[1].z, expect_b.z, 2e-4);
    assert_close(nonlocal.forces[0].x, expect_c.x, 2e-4);
    assert_close(nonlocal.forces[0].z, expect_c.z, 2e-4);
}

#[test]
fn empty_nonlocal_domain_keeps_the_stream_handshake() {
    let settings = cutoff_settings(2.0);
    let mut engine =
        NonbondedGpu::new(DeviceSpec::Host, &settings, list_params(2.0), &no_lj(), true).unwrap();

    let slots = 2 * ATOMS_PER_SUPERCLUSTER;
    engine
        .init_atom_data(&type_atom_data(ATOMS_PER_SUPERCLUSTER, slots))
        .unwrap();
    engine
        .upload_shift_vectors(&vec![Float3::zero(); NUM_SHIFT_VECTORS], false)
        .unwrap();
    engine
        .init_pairlist(&diagonal_list(0..1), InteractionLocality::Local)
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::Local, false);
    engine.setup_short_range_work(InteractionLocality::NonLocal, false);
    assert!(!engine.has_work(InteractionLocality::NonLocal));

    let mut xq = packed_xq(
        &[(Float3::zero(), 1.0), (Float3::new(1.0, 0.0, 0.0), -1.0)],
        slots,
    );

    // First step: every non-local phase skips and drains its markers.
    let workload = forces_only();
    engine.clear_outputs(&workload).unwrap();
    engine.copy_xq_to_device(AtomLocality::Local, &xq).unwrap();
    engine.copy_xq_to_device(AtomLocality::NonLocal, &xq).unwrap();
    engine
        .launch_force_kernel(InteractionLocality::Local, &workload)
        .unwrap();
    engine
        .launch_force_kernel(InteractionLocality::NonLocal, &workload)
        .unwrap();
    engine
        .launch_copy_back(AtomLocality::NonLocal, &workload)
        .unwrap();
    engine.launch_copy_back(AtomLocality::Local, &workload).unwrap();
    let empty = engine
        .wait_and_collect(AtomLocality::NonLocal, &workload)
        .unwrap();
    assert!(empty.forces.is_empty());
    let local = engine
        .wait_and_collect(AtomLocality::Local, &workload)
        .unwrap();
    assert_close(local.forces[0].x, 138.935_458, 1e-4);

    // Work appears on the non-local side for the second step.
    engine
        .init_pairlist(
            &cross_pair_list(CENTRAL_SHIFT_INDEX, 0, CLUSTERS_PER_SUPERCLUSTER),
            InteractionLocality::NonLocal,
        )
        .unwrap();
    engine.setup_short_range_work(InteractionLocality::NonLocal, false);
    xq[ATOMS_PER_SUPERCLUSTER] = Float4::from_xyz_w(Float3::new(0.0, 0.0, 1.0), 1.0);

    engine.clear_outputs(&workload).unwrap();
    engine.copy_xq_to_device(AtomLocality::Local, &xq).unwrap();
    engine.copy_xq_to_device(AtomLocality::NonLocal, &xq).unwrap();
    engine
        .launch_force_kernel(InteractionLocality::Local, &workload)
        .unwrap();
    engine
        .launch_force_kernel(InteractionLocality::NonLocal, &workload)
        .unwrap();
    engine
        .launch_copy_back(AtomLocality::NonLocal, &workload)
        .unwrap();
    engine.launch_copy_back(AtomLocality::Local, &workload).unwrap();
    let nonlocal = engine
        .wait_and_collect(AtomLocality::NonLocal, &workload)
        .unwrap();
    let _ = engine
        .wait_and_collect(AtomLocality::Local, &workload)
        .unwrap();
    assert!(nonlocal.forces[0].z > 0.0);
}

#[test]
fn coordinate_conversion_matches_direct_upload() {
    let settings = cutoff_settings(2.0);
    let real = [
        (Float3::zero(), 1.0),
        (Float3::new(1.0, 0.0, 0.0), -1.0),
    ];

    let mut direct = build(&settings, &no_lj(), 2.0);
    let xq = prime_local(&mut direct, &real, 0..1);
    let reference = step_local(&mut direct, &xq, &forces_only());

    let mut converting = build(&settings, &no_lj(), 2.0);
    prime_local(&mut converting, &real, 0..1);
    let mut atom_index = vec![-1_i32; ATOMS_PER_SUPERCLUSTER];
    atom_index[0] = 0;
    atom_index[1] = 1;
    let charges = [1.0, -1.0];
    converting
        .init_coordinate_conversion(&atom_index, &charges)
        .unwrap();

    let workload = forces_only();
    converting.clear_outputs(&workload).unwrap();
    converting
        .convert_coordinates(AtomLocality::Local, &[real[0].0, real[1].0])
        .unwrap();
    converting
        .launch_force_kernel(InteractionLocality::Local, &workload)
        .unwrap();
    converting
        .launch_copy_back(AtomLocality::Local, &workload)
        .unwrap();
    let out = converting
        .wait_and_collect(AtomLocality::Local, &workload)
        .unwrap();

    assert_close(out.forces[0].x, reference.forces[0].x, 1e-6);
    assert_close(out.forces[1].x, reference.forces[1].x, 1e-6);

    // Mapping entries must point into the source arrays.
    let err = converting
        .init_coordinate_conversion(&vec![7_i32; ATOMS_PER_SUPERCLUSTER], &charges)
        .unwrap_err();
    assert!(matches!(err, EngineError::Mismatch(_)));
}

#[test]
fn update_interaction_constants_rebuilds_scalars_and_tables() {
    let _guard = env_lock();

    // Same kernel flavors, tighter cut-off: the scalar pack refreshes.
    let mut engine = build(&rf_settings(2.0), &no_lj(), 2.0);
    let real = [
        (Float3::zero(), 1.0),
        (Float3::new(1.9, 0.0, 0.0), -1.0),
    ];
    let xq = prime_local(&mut engine, &real, 0..1);
    let before = step_local(&mut engine, &xq, &forces_only());
    assert!(before.forces[0].x != 0.0);

    engine.update_interaction_constants(&rf_settings(1.5)).unwrap();
    let after = step_local(&mut engine, &xq, &forces_only());
    assert_eq!(after.forces[0].x, 0.0);

    // Switching kernel flavors needs a rebuild.
    let err = engine
        .update_interaction_constants(&ewald_settings(1.5, 2.0))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedVariant(_)));

    // A tabulated engine refreshes its force table too.
    std::env::set_var("NBX_TAB_EWALD", "1");
    let mut tab = build(&ewald_settings(1.5, 2.0), &no_lj(), 1.5);
    let mut fresh = build(&ewald_settings(1.5, 3.0), &no_lj(), 1.5);
    assert_eq!(tab.kernel_setup().elec, ElecKind::EwaldTabulated);
    let near = [
        (Float3::zero(), 1.0),
        (Float3::new(0.8, 0.0, 0.0), -1.0),
    ];
    let xq = prime_local(&mut tab, &near, 0..1);
    step_local(&mut tab, &xq, &forces_only());
    tab.update_interaction_constants(&ewald_settings(1.5, 3.0))
        .unwrap();
    std::env::remove_var("NBX_TAB_EWALD");
    let updated = step_local(&mut tab, &xq, &forces_only());

    let xq = prime_local(&mut fresh, &near, 0..1);
    let reference = step_local(&mut fresh, &xq, &forces_only());
    assert_close(updated.forces[0].x, reference.forces[0].x, 1e-5);
}

#[test]
fn timings_accumulate_and_reset() {
    let settings = cutoff_settings(2.0);
    let mut engine = build(&settings, &no_lj(), 2.0);
    if !engine.timing_enabled() {
        return;
    }
    let real = [
        (Float3::zero(), 1.0),
        (Float3::new(1.0, 0.0, 0.0), -1.0),
    ];
    let xq = prime_local(&mut engine, &real, 0..1);
    step_local(&mut engine, &xq, &forces_only());
    step_local(&mut engine, &xq, &forces_only());

    let timings = engine.timings();
    assert_eq!(timings.local.pairlist_h2d.count, 3);
    assert_eq!(timings.local.xq_h2d.count, 2);
    assert_eq!(timings.local.force_kernel.count, 2);
    assert_eq!(timings.local.f_d2h.count, 2);
    assert_eq!(timings.local.prune_kernel.count, 0);
    assert!(timings.local.force_kernel.milliseconds >= 0.0);
    assert_eq!(timings.nonlocal.force_kernel.count, 0);

    engine.reset_timings();
    let cleared = engine.timings();
    assert_eq!(cleared.local.force_kernel.count, 0);
    assert_eq!(cleared.local.pairlist_h2d.count, 0);
}

#[test]
fn free_is_idempotent() {
    let settings = cutoff_settings(2.0);
    let mut engine = build(&settings, &no_lj(), 2.0);
    engine.free().unwrap();
    engine.free().unwrap();
    let err = engine.clear_outputs(&forces_only()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
}
