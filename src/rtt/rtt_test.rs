// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

use super::*;
use crate::addr::{align_up, GRANULE_SIZE};
use crate::mock::{shared_arena, MockRmm, SharedPool};
use crate::realm::{Realm, RealmConfig, VmidAllocator};
use crate::region;
use crate::rmi::Rmi;

fn setup() -> (SharedPool, MockRmm, GranuleTracker, VmidAllocator, Realm) {
    let (arena, mut pool) = shared_arena(4096);
    let mut mock = MockRmm::new(arena);
    let mut tracker = GranuleTracker::new();
    let vmids = VmidAllocator::new();
    let realm = {
        let mut rmi = Rmi::new(&mut mock);
        Realm::create(
            &mut rmi,
            &mut pool,
            &mut tracker,
            &vmids,
            &RealmConfig::basic(16 * GRANULE_SIZE, 0),
        )
        .unwrap()
    };
    (pool, mock, tracker, vmids, realm)
}

#[test]
fn create_levels_builds_the_walk() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let baseline = tracker.outstanding();
    let addr = realm.par_base;

    let before = read_entry(&mut rmi, realm.rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert!(before.walk_level < RTT_PAGE_LEVEL);

    create_levels(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        addr,
        realm.rtt_start_level,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
    )
    .unwrap();
    assert_eq!(tracker.outstanding(), baseline + 3);

    let after = read_entry(&mut rmi, realm.rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert_eq!(after.walk_level, RTT_PAGE_LEVEL);
    assert_eq!(after.state, Hipas::Unassigned);
    assert_eq!(after.ripas, Ripas::Empty);
}

#[test]
fn create_levels_with_equal_bounds_is_a_noop() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let baseline = tracker.outstanding();

    create_levels(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        2,
        2,
        PRIMARY_TREE,
    )
    .unwrap();
    assert_eq!(tracker.outstanding(), baseline);
}

#[test]
fn destroy_reclaims_the_node_granules() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let baseline = tracker.outstanding();
    let addr = realm.par_base;

    create_levels(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        addr,
        realm.rtt_start_level,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
    )
    .unwrap();

    // Bottom-up, one level at a time.
    for level in (1..=RTT_PAGE_LEVEL).rev() {
        destroy(&mut rmi, &mut pool, &mut tracker, realm.rd, addr, level, PRIMARY_TREE).unwrap();
    }
    assert_eq!(tracker.outstanding(), baseline);
}

#[test]
fn fold_reclaims_a_homogeneous_table() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let addr = realm.par_base;

    create_levels(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        addr,
        realm.rtt_start_level,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
    )
    .unwrap();
    let baseline = tracker.outstanding();

    fold(&mut rmi, &mut pool, &mut tracker, realm.rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert_eq!(tracker.outstanding(), baseline - 1);

    let entry = read_entry(&mut rmi, realm.rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert_eq!(entry.walk_level, RTT_PAGE_LEVEL - 1);
}

#[test]
fn folding_and_unfolding_a_mapped_block_preserves_every_page() {
    let (arena, mut pool) = shared_arena(4096);
    let mut mock = MockRmm::new(arena);
    let mut tracker = GranuleTracker::new();
    let vmids = VmidAllocator::new();
    let mut realm = {
        let mut rmi = Rmi::new(&mut mock);
        Realm::create(
            &mut rmi,
            &mut pool,
            &mut tracker,
            &vmids,
            &RealmConfig::basic(1024 * GRANULE_SIZE, 0),
        )
        .unwrap()
    };
    let mut rmi = Rmi::new(&mut mock);

    // A whole level-3 table's worth of pages, block-aligned.
    let block_size = rtt_map_size(RTT_PAGE_LEVEL - 1);
    let block = align_up(realm.par_base, block_size);
    let offset = block - realm.par_base;
    realm
        .init_ripas(&mut rmi, &mut pool, &mut tracker, offset, block_size)
        .unwrap();
    realm
        .map_unknown(&mut rmi, &mut pool, &mut tracker, offset, block_size)
        .unwrap();

    let baseline = tracker.outstanding();
    fold(&mut rmi, &mut pool, &mut tracker, realm.rd, block, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert_eq!(tracker.outstanding(), baseline - 1);

    // The whole range reads back as a single assigned block entry.
    let folded = read_entry(
        &mut rmi,
        realm.rd,
        block + 17 * GRANULE_SIZE,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
    )
    .unwrap();
    assert_eq!(folded.walk_level, RTT_PAGE_LEVEL - 1);
    assert_eq!(folded.state, Hipas::Assigned);
    assert_eq!(folded.ripas, Ripas::Ram);
    assert_eq!(folded.out_addr, block);

    // Re-creating the table unfolds the block; every constituent page
    // comes back with the state it carried before the fold.
    create_levels(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        block,
        RTT_PAGE_LEVEL - 1,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
    )
    .unwrap();
    assert_eq!(tracker.outstanding(), baseline);
    for page in [0u64, 17, 511] {
        let addr = block + page * GRANULE_SIZE;
        let entry = read_entry(&mut rmi, realm.rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
        assert_eq!(entry.walk_level, RTT_PAGE_LEVEL);
        assert_eq!(entry.state, Hipas::Assigned);
        assert_eq!(entry.ripas, Ripas::Ram);
        assert_eq!(entry.out_addr, addr);
    }
}

#[test]
fn with_repair_creates_the_missing_levels_and_retries() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup();
    let mut rmi = Rmi::new(&mut mock);
    let baseline = tracker.outstanding();

    let ns_pa = pool.alloc_pages(1).unwrap();
    let map_addr = ns_pa | realm.ns_flag();
    let descriptor = ns_pa | region::desc::ATTRS;

    with_repair(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        map_addr,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
        |rmi| rmi.rtt_map_unprotected(realm.rd, map_addr, RTT_PAGE_LEVEL, descriptor),
    )
    .unwrap();
    // Three tables were created on the way down.
    assert_eq!(tracker.outstanding(), baseline + 3);

    let entry = read_entry(&mut rmi, realm.rd, map_addr, RTT_PAGE_LEVEL, PRIMARY_TREE).unwrap();
    assert_eq!(entry.state, Hipas::Assigned);
    assert_eq!(entry.out_addr, ns_pa);

    // A second mapping of the same page is a real error: the walk is
    // complete, so no repair applies and the failure propagates.
    let again = with_repair(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        map_addr,
        RTT_PAGE_LEVEL,
        PRIMARY_TREE,
        |rmi| rmi.rtt_map_unprotected(realm.rd, map_addr, RTT_PAGE_LEVEL, descriptor),
    );
    assert!(again.is_err());
}
