// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Granule delegation bookkeeping.
//!
//! Every granule handed to the realm world passes through here so the
//! host always knows what it still owes the monitor. The tracker is the
//! ground truth for the teardown invariant: after a realm is destroyed,
//! [`GranuleTracker::outstanding`] must be zero.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::addr::{is_aligned, GRANULE_SIZE};
use crate::error::{Error, Result};
use crate::pool::PagePool;
use crate::rmi::Rmi;
use crate::smc::Monitor;

#[cfg(test)]
mod granule_test;

/// Records which granules are currently delegated to the realm world.
#[derive(Debug, Default)]
pub struct GranuleTracker {
    delegated: BTreeSet<u64>,
}

impl GranuleTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of granules still delegated.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.delegated.len()
    }

    /// Whether `addr` is currently delegated.
    #[must_use]
    pub fn is_delegated(&self, addr: u64) -> bool {
        self.delegated.contains(&addr)
    }
}

/// Delegates the granule at `addr` to the realm world.
pub fn delegate<M: Monitor>(
    rmi: &mut Rmi<M>,
    tracker: &mut GranuleTracker,
    addr: u64,
) -> Result<()> {
    if !is_aligned(addr, GRANULE_SIZE) {
        return Err(Error::Misaligned(addr));
    }
    rmi.granule_delegate(addr)?;
    tracker.delegated.insert(addr);
    Ok(())
}

/// Returns the granule at `addr` to the normal world.
pub fn undelegate<M: Monitor>(
    rmi: &mut Rmi<M>,
    tracker: &mut GranuleTracker,
    addr: u64,
) -> Result<()> {
    if !is_aligned(addr, GRANULE_SIZE) {
        return Err(Error::Misaligned(addr));
    }
    rmi.granule_undelegate(addr)?;
    tracker.delegated.remove(&addr);
    Ok(())
}

/// Allocates one pool page and delegates it. On delegation failure the
/// page goes straight back to the pool.
pub fn alloc_delegated<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    count: usize,
) -> Result<u64> {
    let base = pool.alloc_pages(count).ok_or(Error::OutOfMemory)?;
    for i in 0..count {
        let page = base + (i as u64) * GRANULE_SIZE;
        if let Err(e) = delegate(rmi, tracker, page) {
            for j in (0..i).rev() {
                let undo = base + (j as u64) * GRANULE_SIZE;
                if undelegate(rmi, tracker, undo).is_err() {
                    log::warn!("leaking granule {undo:#x}: undelegate failed during unwind");
                }
            }
            pool.free_pages(base, count);
            return Err(e);
        }
    }
    Ok(base)
}

/// Undelegates one granule and returns it to the pool.
pub fn release<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    page: u64,
) -> Result<()> {
    undelegate(rmi, tracker, page)?;
    pool.free_pages(page, 1);
    Ok(())
}

/// Cleanup list for multi-step construction paths.
///
/// Callers push each granule as soon as it is delegated and each pool
/// allocation as soon as it is made; on failure [`Unwind::abort`] walks
/// the lists in reverse. On success the lists are simply dropped, since
/// ownership has moved into a realm structure by then.
#[derive(Debug, Default)]
pub(crate) struct Unwind {
    delegated: Vec<u64>,
    pages: Vec<(u64, usize)>,
}

impl Unwind {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_delegated(&mut self, addr: u64) {
        self.delegated.push(addr);
    }

    pub(crate) fn push_pages(&mut self, base: u64, count: usize) {
        self.pages.push((base, count));
    }

    /// Undoes everything recorded so far, most recent first. Failures
    /// are logged and skipped; an unwind must always run to completion.
    pub(crate) fn abort<M: Monitor, P: PagePool>(
        self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
    ) {
        for addr in self.delegated.into_iter().rev() {
            if undelegate(rmi, tracker, addr).is_err() {
                log::warn!("leaking granule {addr:#x}: undelegate failed during unwind");
            }
        }
        for (base, count) in self.pages.into_iter().rev() {
            pool.free_pages(base, count);
        }
    }
}
