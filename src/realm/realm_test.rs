// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

use super::*;
use crate::mock::{shared_arena, MockRmm, SharedPool};
use crate::rmi::{fid, RmiError};
use crate::rtt::{Hipas, Ripas};

fn setup() -> (SharedPool, MockRmm, GranuleTracker, VmidAllocator) {
    let (arena, pool) = shared_arena(8192);
    (pool, MockRmm::new(arena), GranuleTracker::new(), VmidAllocator::new())
}

#[test]
fn full_lifecycle_balances_every_granule() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let mut realm = Realm::create(
        &mut rmi,
        &mut pool,
        &mut tracker,
        &vmids,
        &RealmConfig::basic(16 * GRANULE_SIZE, 0x1000),
    )
    .unwrap();
    assert_eq!(realm.state, RealmState::New);
    assert_eq!(realm.recs.len(), 1);

    realm
        .init_ripas(&mut rmi, &mut pool, &mut tracker, 0, 4 * GRANULE_SIZE)
        .unwrap();
    realm
        .map_payload(&mut rmi, &mut pool, &mut tracker, 0, b"realm payload")
        .unwrap();
    realm.map_shared_page(&mut rmi, &mut pool, &mut tracker).unwrap();
    realm.activate(&mut rmi).unwrap();
    assert_eq!(realm.state, RealmState::Active);

    let entry = crate::rtt::read_entry(
        &mut rmi,
        realm.rd,
        realm.par_base,
        crate::addr::RTT_PAGE_LEVEL,
        crate::rtt::PRIMARY_TREE,
    )
    .unwrap();
    assert_eq!(entry.state, Hipas::Assigned);
    assert_eq!(entry.ripas, Ripas::Ram);

    realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
    assert_eq!(realm.state, RealmState::Null);
    assert_eq!(tracker.outstanding(), 0);
    drop(rmi);
    assert_eq!(mock.owned_granules(), 0);

    // Destroy is idempotent once the realm is gone.
    let mut rmi = Rmi::new(&mut mock);
    realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
}

#[test]
fn activate_twice_is_refused() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let mut realm = Realm::create(
        &mut rmi,
        &mut pool,
        &mut tracker,
        &vmids,
        &RealmConfig::basic(GRANULE_SIZE, 0),
    )
    .unwrap();

    realm.activate(&mut rmi).unwrap();
    assert_eq!(realm.activate(&mut rmi), Err(Error::State(RealmState::Active)));
}

#[test]
fn payload_after_activation_is_refused() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let mut realm = Realm::create(
        &mut rmi,
        &mut pool,
        &mut tracker,
        &vmids,
        &RealmConfig::basic(GRANULE_SIZE, 0),
    )
    .unwrap();
    realm.activate(&mut rmi).unwrap();
    assert_eq!(
        realm.map_payload(&mut rmi, &mut pool, &mut tracker, 0, b"late"),
        Err(Error::State(RealmState::Active))
    );
    // Zero-fill data is initial content too; it is sealed with the rest.
    assert_eq!(
        realm.map_unknown(&mut rmi, &mut pool, &mut tracker, 0, GRANULE_SIZE),
        Err(Error::State(RealmState::Active))
    );
}

#[test]
fn invalid_configurations_are_rejected_up_front() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let mut no_recs = RealmConfig::basic(GRANULE_SIZE, 0);
    no_recs.recs.clear();
    assert!(matches!(
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &no_recs),
        Err(Error::Config(_))
    ));

    // Permission indirection without per-plane trees is contradictory.
    let mut bad_planes = RealmConfig::basic(GRANULE_SIZE, 0);
    bad_planes.num_aux_planes = 1;
    bad_planes.s2ap_indirection = true;
    assert!(matches!(
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &bad_planes),
        Err(Error::Config(_))
    ));

    let mut too_many = RealmConfig::basic(GRANULE_SIZE, 0);
    too_many.num_aux_planes = 9;
    assert!(matches!(
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &too_many),
        Err(Error::Config(_))
    ));

    // Nothing leaked across the refusals.
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn failed_create_unwinds_cleanly() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();

    mock.fail_next(fid::REALM_CREATE, RmiError::Input);
    {
        let mut rmi = Rmi::new(&mut mock);
        let result = Realm::create(
            &mut rmi,
            &mut pool,
            &mut tracker,
            &vmids,
            &RealmConfig::basic(4 * GRANULE_SIZE, 0),
        );
        assert!(result.is_err());
    }
    assert_eq!(tracker.outstanding(), 0);
    assert_eq!(mock.owned_granules(), 0);

    // Failing later, at context creation, still unwinds everything
    // including the already-created descriptor.
    mock.fail_next(fid::REC_CREATE, RmiError::Input);
    {
        let mut rmi = Rmi::new(&mut mock);
        let result = Realm::create(
            &mut rmi,
            &mut pool,
            &mut tracker,
            &vmids,
            &RealmConfig::basic(4 * GRANULE_SIZE, 0),
        );
        assert!(result.is_err());
    }
    assert_eq!(tracker.outstanding(), 0);
    assert_eq!(mock.owned_granules(), 0);

    // The allocator is healthy afterwards.
    let mut rmi = Rmi::new(&mut mock);
    let mut realm = Realm::create(
        &mut rmi,
        &mut pool,
        &mut tracker,
        &vmids,
        &RealmConfig::basic(4 * GRANULE_SIZE, 0),
    )
    .unwrap();
    realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn per_plane_trees_are_created_and_torn_down() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let mut config = RealmConfig::basic(8 * GRANULE_SIZE, 0);
    config.num_aux_planes = 2;
    config.rtt_tree_per_plane = true;
    let mut realm =
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &config).unwrap();
    assert_eq!(realm.aux_rtt_base.len(), 2);
    assert_eq!(realm.tree_indices().collect::<alloc::vec::Vec<_>>(), [0, 1, 2]);

    realm.map_shared_page(&mut rmi, &mut pool, &mut tracker).unwrap();
    realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
    assert_eq!(tracker.outstanding(), 0);
    drop(rmi);
    assert_eq!(mock.owned_granules(), 0);
}

#[test]
fn requested_features_are_downgraded_to_what_the_monitor_offers() {
    let (mut pool, mut mock, mut tracker, vmids) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let mut config = RealmConfig::basic(GRANULE_SIZE, 0);
    // Far beyond what the default model advertises.
    config.sve_vl = Some(15);
    config.pmu_num_ctrs = Some(31);
    let mut realm =
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &config).unwrap();
    realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
}

#[test]
fn affinity_packing_is_sparse() {
    assert_eq!(rec_mpidr(0), 0);
    assert_eq!(rec_mpidr(5), 5);
    assert_eq!(rec_mpidr(16), 1 << 8);
    assert_eq!(rec_mpidr(17), (1 << 8) | 1);
    assert_eq!(rec_mpidr(1 << 12), 1 << 16);
    assert_eq!(rec_mpidr(1 << 20), 1 << 32);
}

#[test]
fn starting_table_count_follows_the_address_width() {
    assert_eq!(num_start_tables(39, 0), 1);
    assert_eq!(num_start_tables(48, 0), 1);
    assert_eq!(num_start_tables(39, 1), 1);
    assert_eq!(num_start_tables(40, 1), 2);
    assert_eq!(num_start_tables(48, 1), 512);
    assert_eq!(num_start_tables(30, 2), 1);
    assert_eq!(num_start_tables(31, 2), 2);
}

#[test]
fn vmid_allocator_recycles() {
    let vmids = VmidAllocator::new();
    let a = vmids.alloc();
    let b = vmids.alloc();
    assert_ne!(a, b);
    vmids.free(a);
    assert_eq!(vmids.alloc(), a);
}
