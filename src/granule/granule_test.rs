// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

use super::*;
use crate::error::Error;
use crate::mock::{shared_arena, MockRmm, SharedPool, ARENA_BASE};
use crate::rmi::{fid, Rmi, RmiError};

fn setup() -> (SharedPool, MockRmm, GranuleTracker) {
    let (arena, pool) = shared_arena(256);
    let mock = MockRmm::new(arena);
    (pool, mock, GranuleTracker::new())
}

#[test]
fn delegate_and_undelegate_balance() {
    let (_pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    delegate(&mut rmi, &mut tracker, ARENA_BASE).unwrap();
    assert_eq!(tracker.outstanding(), 1);
    assert!(tracker.is_delegated(ARENA_BASE));

    undelegate(&mut rmi, &mut tracker, ARENA_BASE).unwrap();
    assert_eq!(tracker.outstanding(), 0);
    assert!(!tracker.is_delegated(ARENA_BASE));
}

#[test]
fn double_delegate_is_refused() {
    let (_pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    delegate(&mut rmi, &mut tracker, ARENA_BASE).unwrap();
    assert_eq!(
        delegate(&mut rmi, &mut tracker, ARENA_BASE),
        Err(Error::Rmi(RmiError::Input))
    );
    assert_eq!(tracker.outstanding(), 1);
}

#[test]
fn misaligned_addresses_never_reach_the_monitor() {
    let (_pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    assert_eq!(
        delegate(&mut rmi, &mut tracker, ARENA_BASE + 0x10),
        Err(Error::Misaligned(ARENA_BASE + 0x10))
    );
    assert_eq!(
        undelegate(&mut rmi, &mut tracker, ARENA_BASE + 0x10),
        Err(Error::Misaligned(ARENA_BASE + 0x10))
    );
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn undelegate_of_unowned_granule_is_refused() {
    let (_pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    assert_eq!(
        undelegate(&mut rmi, &mut tracker, ARENA_BASE),
        Err(Error::Rmi(RmiError::Input))
    );
}

#[test]
fn alloc_delegated_and_release_round_trip() {
    let (mut pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let base = alloc_delegated(&mut rmi, &mut pool, &mut tracker, 3).unwrap();
    assert_eq!(tracker.outstanding(), 3);
    for i in 0..3 {
        assert!(tracker.is_delegated(base + i * GRANULE_SIZE));
    }
    for i in 0..3 {
        release(&mut rmi, &mut pool, &mut tracker, base + i * GRANULE_SIZE).unwrap();
    }
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn alloc_delegated_unwinds_on_delegation_failure() {
    let (mut pool, mut mock, mut tracker) = setup();
    mock.fail_next(fid::GRANULE_DELEGATE, RmiError::Input);
    let mut rmi = Rmi::new(&mut mock);

    let result = alloc_delegated(&mut rmi, &mut pool, &mut tracker, 2);
    assert_eq!(result, Err(Error::Rmi(RmiError::Input)));
    assert_eq!(tracker.outstanding(), 0);

    // The pages went back to the pool: the next allocation reuses them.
    let base = alloc_delegated(&mut rmi, &mut pool, &mut tracker, 2).unwrap();
    assert_eq!(base, ARENA_BASE);
}

#[test]
fn unwind_reverses_in_order() {
    let (mut pool, mut mock, mut tracker) = setup();
    let mut rmi = Rmi::new(&mut mock);

    let mut unwind = Unwind::new();
    let a = alloc_delegated(&mut rmi, &mut pool, &mut tracker, 1).unwrap();
    unwind.push_delegated(a);
    unwind.push_pages(a, 1);
    let b = alloc_delegated(&mut rmi, &mut pool, &mut tracker, 1).unwrap();
    unwind.push_delegated(b);
    unwind.push_pages(b, 1);
    assert_eq!(tracker.outstanding(), 2);

    unwind.abort(&mut rmi, &mut pool, &mut tracker);
    assert_eq!(tracker.outstanding(), 0);
}
