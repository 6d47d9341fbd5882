// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Translation-tree plumbing shared by every mapping operation.
//!
//! The monitor reports a missing intermediate table as a walk error
//! carrying the level it stopped at. Rather than precomputing which
//! tables a mapping needs, callers go through [`with_repair`]: attempt
//! the operation, and on a walk error create the missing levels and
//! retry exactly once. A second walk error at the same or a deeper
//! level is a real fault and propagates.

use crate::addr::{align_down, rtt_map_size, RTT_PAGE_LEVEL};
use crate::error::{Error, Result};
use crate::granule::{self, GranuleTracker};
use crate::pool::PagePool;
use crate::rmi::{Rmi, RmiError, RmiResult};
use crate::smc::Monitor;

#[cfg(test)]
mod rtt_test;

/// The primary tree. Auxiliary trees are numbered from 1.
pub const PRIMARY_TREE: u64 = 0;

/// Host-side ownership state of a protected address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hipas {
    /// No data granule is attached.
    Unassigned,
    /// A delegated data granule backs the address.
    Assigned,
    /// The entry points at a next-level table.
    Table,
}

impl Hipas {
    /// Decodes the wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Unassigned),
            1 => Some(Self::Assigned),
            2 => Some(Self::Table),
            _ => None,
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        match self {
            Self::Unassigned => 0,
            Self::Assigned => 1,
            Self::Table => 2,
        }
    }
}

/// Realm-visible content class of a protected address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ripas {
    /// Not usable by the realm; realm access faults.
    Empty,
    /// Ordinary memory.
    Ram,
    /// Contents were destroyed by the host; access is fatal to the realm.
    Destroyed,
    /// Device memory.
    Dev,
}

impl Ripas {
    /// Decodes the wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Ram),
            2 => Some(Self::Destroyed),
            3 => Some(Self::Dev),
            _ => None,
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Ram => 1,
            Self::Destroyed => 2,
            Self::Dev => 3,
        }
    }
}

/// One decoded tree entry, as observed by a non-mutating walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEntry {
    /// Level the walk actually reached (may be shallower than asked).
    pub walk_level: i8,
    pub state: Hipas,
    pub ripas: Ripas,
    /// Physical output address: the data granule for assigned entries,
    /// the next-level table for table entries, zero otherwise.
    pub out_addr: u64,
}

/// Non-mutating walk of tree `tree` down to at most `level`.
pub fn read_entry<M: Monitor>(
    rmi: &mut Rmi<M>,
    rd: u64,
    map_addr: u64,
    level: i8,
    tree: u64,
) -> Result<RttEntry> {
    Ok(rmi.rtt_read_entry(rd, map_addr, level, tree)?)
}

/// Creates the intermediate tables covering `map_addr` at levels
/// `(from, to]`. Each node is one freshly delegated granule. No-op when
/// `from == to`.
pub fn create_levels<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    map_addr: u64,
    from: i8,
    to: i8,
    tree: u64,
) -> Result<()> {
    debug_assert!(from <= to && to <= RTT_PAGE_LEVEL);
    let mut level = from + 1;
    while level <= to {
        let node = granule::alloc_delegated(rmi, pool, tracker, 1)?;
        // A node at `level` is indexed by its parent entry, so the map
        // address must be aligned to the parent's reach.
        let aligned = align_down(map_addr, rtt_map_size(level - 1));
        let created = if tree == PRIMARY_TREE {
            rmi.rtt_create(rd, node, aligned, level)
        } else {
            rmi.rtt_aux_create(rd, node, aligned, level, tree)
        };
        if let Err(e) = created {
            granule::release(rmi, pool, tracker, node)?;
            return Err(e.into());
        }
        level += 1;
    }
    Ok(())
}

/// Removes the childless node of tree `tree` covering `map_addr` at
/// `level`, returning its granule to the pool. Yields the next boundary
/// address reported by the monitor.
pub fn destroy<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    map_addr: u64,
    level: i8,
    tree: u64,
) -> Result<u64> {
    let (node, top) = if tree == PRIMARY_TREE {
        rmi.rtt_destroy(rd, map_addr, level)?
    } else {
        rmi.rtt_aux_destroy(rd, map_addr, level, tree)?
    };
    granule::release(rmi, pool, tracker, node)?;
    Ok(top)
}

/// Collapses a homogeneous child table back into its parent entry and
/// reclaims the node granule.
pub fn fold<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    map_addr: u64,
    level: i8,
    tree: u64,
) -> Result<()> {
    let node = if tree == PRIMARY_TREE {
        rmi.rtt_fold(rd, map_addr, level)?
    } else {
        rmi.rtt_aux_fold(rd, map_addr, level, tree)?
    };
    granule::release(rmi, pool, tracker, node)
}

/// Runs `op`, repairing one missing-table walk error by creating the
/// levels down to `target_level` and retrying once.
pub fn with_repair<M, P, T, F>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    map_addr: u64,
    target_level: i8,
    tree: u64,
    mut op: F,
) -> Result<T>
where
    M: Monitor,
    P: PagePool,
    F: FnMut(&mut Rmi<M>) -> RmiResult<T>,
{
    match op(rmi) {
        Ok(v) => return Ok(v),
        Err(RmiError::Rtt(stopped)) if tree == PRIMARY_TREE && stopped < target_level => {
            create_levels(rmi, pool, tracker, rd, map_addr, stopped, target_level, tree)?;
        }
        Err(RmiError::RttAux(stopped)) if tree != PRIMARY_TREE && stopped < target_level => {
            create_levels(rmi, pool, tracker, rd, map_addr, stopped, target_level, tree)?;
        }
        Err(e) => return Err(Error::Rmi(e)),
    }
    op(rmi).map_err(Error::Rmi)
}

/// Mirrors an already-assigned protected page into auxiliary tree
/// `tree`, creating missing levels on demand. Used to resolve plane
/// stage-2 faults when each plane carries its own tree.
pub fn aux_map_protected<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    map_addr: u64,
    tree: u64,
) -> Result<()> {
    with_repair(
        rmi,
        pool,
        tracker,
        rd,
        map_addr,
        RTT_PAGE_LEVEL,
        tree,
        |rmi| rmi.rtt_aux_map_protected(rd, map_addr, tree),
    )
}
