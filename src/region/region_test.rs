// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

use proptest::prelude::*;

use super::*;
use crate::mock::{shared_arena, MockRmm, SharedPool};
use crate::realm::{Realm, RealmConfig, RealmState, VmidAllocator};
use crate::rmi::Rmi;
use crate::rtt::Ripas;

fn setup(config: RealmConfig) -> (SharedPool, MockRmm, GranuleTracker, VmidAllocator, Realm) {
    let (arena, mut pool) = shared_arena(8192);
    let mut mock = MockRmm::new(arena);
    let mut tracker = GranuleTracker::new();
    let vmids = VmidAllocator::new();
    let realm = {
        let mut rmi = Rmi::new(&mut mock);
        Realm::create(&mut rmi, &mut pool, &mut tracker, &vmids, &config).unwrap()
    };
    (pool, mock, tracker, vmids, realm)
}

fn basic() -> RealmConfig {
    RealmConfig::basic(16 * GRANULE_SIZE, 0)
}

fn entry_at<M: crate::smc::Monitor>(
    rmi: &mut Rmi<M>,
    rd: u64,
    addr: u64,
    tree: u64,
) -> crate::rtt::RttEntry {
    rtt::read_entry(rmi, rd, addr, RTT_PAGE_LEVEL, tree).unwrap()
}

#[test]
fn measured_data_becomes_assigned_ram() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    let src = pool.alloc_pages(2).unwrap();
    pool.write(src, b"payload");
    map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        2 * GRANULE_SIZE,
        Some(src),
    )
    .unwrap();

    for i in 0..2 {
        let entry = entry_at(&mut rmi, realm.rd, realm.par_base + i * GRANULE_SIZE, PRIMARY_TREE);
        assert_eq!(entry.state, Hipas::Assigned);
        assert_eq!(entry.ripas, Ripas::Ram);
        assert_eq!(entry.out_addr, realm.par_base + i * GRANULE_SIZE);
    }

    // The page contents traveled with the mapping.
    let mut buf = [0u8; 7];
    pool.read(realm.par_base, &mut buf);
    assert_eq!(&buf, b"payload");
}

#[test]
fn zero_fill_data_keeps_the_declared_content_state() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    // Without a prior declaration the page stays empty.
    map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
        None,
    )
    .unwrap();
    let entry = entry_at(&mut rmi, realm.rd, realm.par_base, PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Assigned);
    assert_eq!(entry.ripas, Ripas::Empty);

    // With one it is RAM.
    let second = realm.par_base + GRANULE_SIZE;
    init_ripas(&mut rmi, &mut pool, &mut tracker, realm.rd, second, GRANULE_SIZE).unwrap();
    map_protected_data(&mut rmi, &mut pool, &mut tracker, realm.rd, second, GRANULE_SIZE, None)
        .unwrap();
    let entry = entry_at(&mut rmi, realm.rd, second, PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Assigned);
    assert_eq!(entry.ripas, Ripas::Ram);
}

#[test]
fn destroyed_data_leaves_a_poisoned_content_state() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
        None,
    )
    .unwrap();
    let delegated = tracker.outstanding();

    destroy_protected_data(&mut rmi, &mut tracker, realm.rd, realm.par_base, GRANULE_SIZE)
        .unwrap();
    assert_eq!(tracker.outstanding(), delegated - 1);

    let entry = entry_at(&mut rmi, realm.rd, realm.par_base, PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Unassigned);
    assert_eq!(entry.ripas, Ripas::Destroyed);
}

#[test]
fn destroy_skips_unpopulated_holes() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    // Map only the third page; destroying the whole range must skip the
    // unmapped pages in front of it.
    let third = realm.par_base + 2 * GRANULE_SIZE;
    map_protected_data(&mut rmi, &mut pool, &mut tracker, realm.rd, third, GRANULE_SIZE, None)
        .unwrap();
    destroy_protected_data(
        &mut rmi,
        &mut tracker,
        realm.rd,
        realm.par_base,
        4 * GRANULE_SIZE,
    )
    .unwrap();
    let entry = entry_at(&mut rmi, realm.rd, third, PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Unassigned);
    assert_eq!(entry.ripas, Ripas::Destroyed);
}

#[test]
fn unprotected_mappings_round_trip() {
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    let ns = pool.alloc_pages(2).unwrap();
    map_unprotected(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        ns,
        2 * GRANULE_SIZE,
        realm.ns_flag(),
        PRIMARY_TREE,
    )
    .unwrap();
    let entry = entry_at(&mut rmi, realm.rd, ns | realm.ns_flag(), PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Assigned);
    assert_eq!(entry.out_addr, ns);

    unmap_unprotected(&mut rmi, realm.rd, ns, 2 * GRANULE_SIZE, realm.ns_flag(), PRIMARY_TREE)
        .unwrap();
    let entry = entry_at(&mut rmi, realm.rd, ns | realm.ns_flag(), PRIMARY_TREE);
    assert_eq!(entry.state, Hipas::Unassigned);
}

#[test]
fn ripas_init_is_refused_after_activation() {
    let (mut pool, mut mock, mut tracker, _vmids, mut realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    realm.activate(&mut rmi).unwrap();
    assert_eq!(realm.state, RealmState::Active);
    let result = init_ripas(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
    );
    assert!(matches!(result, Err(Error::Rmi(_))));
}

#[test]
fn ripas_init_spans_leaf_table_boundaries() {
    let mut config = basic();
    config.par_size = 1024 * GRANULE_SIZE;
    let (mut pool, mut mock, mut tracker, _vmids, realm) = setup(config);
    let mut rmi = Rmi::new(&mut mock);

    // 4 MiB spans several leaf tables: the monitor stops at every
    // table boundary and the loop has to keep going.
    let start = realm.par_base;
    let size = 1024 * GRANULE_SIZE;
    init_ripas(&mut rmi, &mut pool, &mut tracker, realm.rd, start, size).unwrap();

    for addr in [start, start + size / 2, start + size - GRANULE_SIZE] {
        let entry = entry_at(&mut rmi, realm.rd, addr, PRIMARY_TREE);
        assert_eq!(entry.ripas, Ripas::Ram);
    }
}

#[test]
fn data_create_is_refused_after_activation() {
    let (mut pool, mut mock, mut tracker, _vmids, mut realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    realm.activate(&mut rmi).unwrap();
    let baseline = tracker.outstanding();

    // The monitor itself refuses both variants once the realm is
    // sealed, and the partial delegation is rolled back.
    let result = map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
        None,
    );
    assert!(matches!(result, Err(Error::Rmi(_))));
    assert_eq!(tracker.outstanding(), baseline);

    let src = pool.alloc_pages(1).unwrap();
    let result = map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
        Some(src),
    );
    assert!(matches!(result, Err(Error::Rmi(_))));
    assert_eq!(tracker.outstanding(), baseline);
}

#[test]
fn teardown_returns_every_granule() {
    let (mut pool, mut mock, mut tracker, _vmids, mut realm) = setup(basic());
    let mut rmi = Rmi::new(&mut mock);

    let src = pool.alloc_pages(1).unwrap();
    map_protected_data(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        realm.par_base,
        GRANULE_SIZE,
        Some(src),
    )
    .unwrap();
    let ns = pool.alloc_pages(1).unwrap();
    map_unprotected(
        &mut rmi,
        &mut pool,
        &mut tracker,
        realm.rd,
        ns,
        GRANULE_SIZE,
        realm.ns_flag(),
        PRIMARY_TREE,
    )
    .unwrap();

    realm
        .destroy(&mut rmi, &mut pool, &mut tracker, &_vmids)
        .unwrap();
    assert_eq!(tracker.outstanding(), 0);
    drop(rmi);
    assert_eq!(mock.owned_granules(), 0);
}

/// One step of the randomized exercise below.
#[derive(Debug, Clone, Copy)]
enum Step {
    MapUnknown(u64),
    Destroy(u64),
    InitRipas(u64),
}

fn step_strategy(pages: u64) -> impl Strategy<Value = Step> {
    (0..3u8, 0..pages).prop_map(|(op, page)| match op {
        0 => Step::MapUnknown(page),
        1 => Step::Destroy(page),
        _ => Step::InitRipas(page),
    })
}

proptest! {
    /// Random data-lifecycle sequences keep the host model, the monitor
    /// model and the delegation balance in agreement, and teardown
    /// always returns every granule.
    #[test]
    fn random_data_lifecycles_stay_consistent(
        steps in proptest::collection::vec(step_strategy(4), 0..24)
    ) {
        let (mut pool, mut mock, mut tracker, vmids, mut realm) = setup(basic());
        let mut rmi = Rmi::new(&mut mock);

        let mut mapped = [false; 4];
        let mut state = [Ripas::Empty; 4];

        for step in steps {
            match step {
                Step::MapUnknown(i) => {
                    let addr = realm.par_base + i * GRANULE_SIZE;
                    let result = map_protected_data(
                        &mut rmi, &mut pool, &mut tracker, realm.rd, addr, GRANULE_SIZE, None,
                    );
                    let i = i as usize;
                    if mapped[i] {
                        prop_assert!(result.is_err());
                    } else {
                        prop_assert!(result.is_ok());
                        mapped[i] = true;
                    }
                }
                Step::Destroy(i) => {
                    let addr = realm.par_base + i * GRANULE_SIZE;
                    destroy_protected_data(&mut rmi, &mut tracker, realm.rd, addr, GRANULE_SIZE)
                        .unwrap();
                    let i = i as usize;
                    if mapped[i] {
                        mapped[i] = false;
                        state[i] = Ripas::Destroyed;
                    }
                }
                Step::InitRipas(i) => {
                    let addr = realm.par_base + i * GRANULE_SIZE;
                    init_ripas(&mut rmi, &mut pool, &mut tracker, realm.rd, addr, GRANULE_SIZE)
                        .unwrap();
                    state[i as usize] = Ripas::Ram;
                }
            }
        }

        for i in 0..4u64 {
            let entry = entry_at(&mut rmi, realm.rd, realm.par_base + i * GRANULE_SIZE, PRIMARY_TREE);
            let i = i as usize;
            if mapped[i] {
                prop_assert_eq!(entry.state, Hipas::Assigned);
            } else {
                prop_assert_eq!(entry.state, Hipas::Unassigned);
            }
            if entry.walk_level == RTT_PAGE_LEVEL {
                prop_assert_eq!(entry.ripas, state[i]);
            }
        }

        realm.destroy(&mut rmi, &mut pool, &mut tracker, &vmids).unwrap();
        prop_assert_eq!(tracker.outstanding(), 0);
        drop(rmi);
        prop_assert_eq!(mock.owned_granules(), 0);
    }
}
