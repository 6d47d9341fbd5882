// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Memory-region lifecycle over translation trees.
//!
//! All operations here are range loops around single-granule monitor
//! calls, with missing-table repair where the call can hit one and a
//! strict forward-progress check where the monitor reports how far a
//! walk got. Partial failures unwind what the loop already did.

use crate::addr::{align_down, align_up, is_aligned, rtt_map_size, GRANULE_SIZE, RTT_PAGE_LEVEL};
use crate::error::{Error, Result};
use crate::granule::{self, GranuleTracker};
use crate::pool::PagePool;
use crate::rmi::{Rmi, RmiError};
use crate::rtt::{self, Hipas, PRIMARY_TREE};
use crate::smc::Monitor;

#[cfg(test)]
mod region_test;

/// Stage-2 descriptor attributes for unprotected mappings: normal
/// write-back memory, read-write, inner shareable, access flag set.
pub mod desc {
    pub const MEMATTR_NORMAL_WB: u64 = 0b1111 << 2;
    pub const AP_RW: u64 = 0b11 << 6;
    pub const SH_INNER: u64 = 0b11 << 8;
    pub const AF: u64 = 1 << 10;
    pub const ATTRS: u64 = MEMATTR_NORMAL_WB | AP_RW | SH_INNER | AF;
}

fn check_range(base: u64, size: u64) -> Result<()> {
    if !is_aligned(base, GRANULE_SIZE) {
        return Err(Error::Misaligned(base));
    }
    if size == 0 || !is_aligned(size, GRANULE_SIZE) {
        return Err(Error::Misaligned(size));
    }
    Ok(())
}

/// Delegates the pages of `[target, target + size)` in place and
/// attaches them as protected data, seeded from `src` page by page, or
/// zero-filled when `src` is `None`.
///
/// The target pages double as the data granules, so the range must lie
/// inside the realm's protected address space where address equals
/// intended physical address. On failure everything already attached is
/// detached and undelegated before the error propagates.
pub fn map_protected_data<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    target: u64,
    size: u64,
    src: Option<u64>,
) -> Result<()> {
    check_range(target, size)?;
    let pages = size / GRANULE_SIZE;
    for i in 0..pages {
        let off = i * GRANULE_SIZE;
        let addr = target + off;
        let result = granule::delegate(rmi, tracker, addr).and_then(|()| {
            rtt::with_repair(
                rmi,
                pool,
                tracker,
                rd,
                addr,
                RTT_PAGE_LEVEL,
                PRIMARY_TREE,
                |rmi| match src {
                    Some(src) => rmi.data_create(false, rd, addr, addr, src + off),
                    None => rmi.data_create(true, rd, addr, addr, 0),
                },
            )
        });
        if let Err(e) = result {
            unwind_protected_data(rmi, tracker, rd, target, i, addr);
            return Err(e);
        }
    }
    Ok(())
}

/// Reverse of a partially completed [`map_protected_data`]: detach and
/// undelegate the `done` attached pages, then undelegate the page the
/// failing step may have delegated without attaching.
fn unwind_protected_data<M: Monitor>(
    rmi: &mut Rmi<M>,
    tracker: &mut GranuleTracker,
    rd: u64,
    target: u64,
    done: u64,
    failed: u64,
) {
    if tracker.is_delegated(failed) {
        if let Err(e) = granule::undelegate(rmi, tracker, failed) {
            log::warn!("leaking granule {failed:#x} during unwind: {e}");
        }
    }
    for i in (0..done).rev() {
        let addr = target + i * GRANULE_SIZE;
        let undone = rmi
            .data_destroy(rd, addr)
            .map_err(Error::Rmi)
            .and_then(|(data, _)| granule::undelegate(rmi, tracker, data));
        if let Err(e) = undone {
            log::warn!("leaking data granule at {addr:#x} during unwind: {e}");
        }
    }
}

/// Detaches the protected data pages of `[target, target + size)` and
/// undelegates them. Entries the monitor reports as non-live are skipped
/// using its progress hint.
pub fn destroy_protected_data<M: Monitor>(
    rmi: &mut Rmi<M>,
    tracker: &mut GranuleTracker,
    rd: u64,
    target: u64,
    size: u64,
) -> Result<()> {
    check_range(target, size)?;
    let end = target + size;
    let mut addr = target;
    while addr < end {
        match rmi.data_destroy(rd, addr) {
            Ok((data, _top)) => {
                granule::undelegate(rmi, tracker, data)?;
                addr += GRANULE_SIZE;
            }
            // Nothing attached here; the walk reports how far the
            // non-live region extends.
            Err(RmiError::Rtt(_)) => {
                let entry = rtt::read_entry(rmi, rd, addr, RTT_PAGE_LEVEL, PRIMARY_TREE)?;
                if entry.state == Hipas::Assigned {
                    return Err(Error::Protocol("data destroy refused on a live entry"));
                }
                let hole = rtt_map_size(entry.walk_level);
                addr = align_down(addr, hole) + hole;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Maps normal-world pages `[ns_pa, ns_pa + size)` into tree `tree` at
/// the aliased addresses `ns_pa | ns_flag`.
pub fn map_unprotected<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    ns_pa: u64,
    size: u64,
    ns_flag: u64,
    tree: u64,
) -> Result<()> {
    check_range(ns_pa, size)?;
    let pages = size / GRANULE_SIZE;
    for i in 0..pages {
        let pa = ns_pa + i * GRANULE_SIZE;
        let map_addr = pa | ns_flag;
        let descriptor = pa | desc::ATTRS;
        let mapped = rtt::with_repair(
            rmi,
            pool,
            tracker,
            rd,
            map_addr,
            RTT_PAGE_LEVEL,
            tree,
            |rmi| {
                if tree == PRIMARY_TREE {
                    rmi.rtt_map_unprotected(rd, map_addr, RTT_PAGE_LEVEL, descriptor)
                } else {
                    rmi.rtt_aux_map_unprotected(rd, map_addr, descriptor, tree)
                }
            },
        );
        if let Err(e) = mapped {
            if unmap_unprotected(rmi, rd, ns_pa, i * GRANULE_SIZE, ns_flag, tree).is_err() {
                log::warn!("unprotected unwind left stale mappings at {ns_pa:#x}");
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Removes the unprotected mappings of `[ns_pa, ns_pa + size)` from
/// tree `tree`. Already-unmapped holes are skipped.
pub fn unmap_unprotected<M: Monitor>(
    rmi: &mut Rmi<M>,
    rd: u64,
    ns_pa: u64,
    size: u64,
    ns_flag: u64,
    tree: u64,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    check_range(ns_pa, size)?;
    let end = (ns_pa + size) | ns_flag;
    let mut addr = ns_pa | ns_flag;
    while addr < end {
        let result = if tree == PRIMARY_TREE {
            rmi.rtt_unmap_unprotected(rd, addr, RTT_PAGE_LEVEL)
        } else {
            rmi.rtt_aux_unmap_unprotected(rd, addr, tree)
        };
        match result {
            Ok(top) => {
                if top <= addr {
                    return Err(Error::Protocol("unmap made no progress"));
                }
                addr = top;
            }
            Err(RmiError::Rtt(l)) | Err(RmiError::RttAux(l)) if l < RTT_PAGE_LEVEL => {
                // Hole: nothing mapped under this entry.
                addr = align_down(addr, rtt_map_size(l)) + rtt_map_size(l);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Declares `[base, base + size)` as RAM before activation. The monitor
/// processes as much as one call can and reports how far it got; missing
/// tables are created one level at a time.
pub fn init_ripas<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    base: u64,
    size: u64,
) -> Result<()> {
    check_range(base, size)?;
    let end = base + size;
    let mut addr = base;
    while addr < end {
        match rmi.rtt_init_ripas(rd, addr, end) {
            Ok(top) => {
                if top <= addr {
                    return Err(Error::Protocol("ripas init made no progress"));
                }
                addr = top;
            }
            Err(RmiError::Rtt(stopped)) if stopped < RTT_PAGE_LEVEL => {
                let deeper = stopped + 1;
                rtt::create_levels(rmi, pool, tracker, rd, addr, stopped, deeper, PRIMARY_TREE)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Applies a content-state change requested by the execution context at
/// `rec` over `[base, top)`.
pub fn set_ripas<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    rec: u64,
    base: u64,
    top: u64,
) -> Result<()> {
    check_range(base, top - base)?;
    let mut addr = base;
    while addr < top {
        match rmi.rtt_set_ripas(rd, rec, addr, top) {
            Ok(progressed) => {
                if progressed <= addr {
                    return Err(Error::Protocol("ripas change made no progress"));
                }
                addr = progressed;
            }
            Err(RmiError::Rtt(stopped)) if stopped < RTT_PAGE_LEVEL => {
                let deeper = stopped + 1;
                rtt::create_levels(rmi, pool, tracker, rd, addr, stopped, deeper, PRIMARY_TREE)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Applies an access-permission change requested by the execution
/// context at `rec` over `[base, top)`. `tree` names the plane's tree
/// for missing-table repair when the planes do not share one.
pub fn set_s2ap<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    rec: u64,
    base: u64,
    top: u64,
    tree: u64,
) -> Result<()> {
    check_range(base, top - base)?;
    let mut addr = base;
    while addr < top {
        match rmi.rtt_set_s2ap(rd, rec, addr, top) {
            Ok(progressed) => {
                if progressed <= addr {
                    return Err(Error::Protocol("permission change made no progress"));
                }
                addr = progressed;
            }
            Err(RmiError::Rtt(stopped)) if tree == PRIMARY_TREE && stopped < RTT_PAGE_LEVEL => {
                let deeper = stopped + 1;
                rtt::create_levels(rmi, pool, tracker, rd, addr, stopped, deeper, tree)?;
            }
            Err(RmiError::RttAux(stopped)) if tree != PRIMARY_TREE && stopped < RTT_PAGE_LEVEL => {
                let deeper = stopped + 1;
                rtt::create_levels(rmi, pool, tracker, rd, addr, stopped, deeper, tree)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Recursively empties tree `tree` over `[start, end)` from `level`
/// down: protected data is destroyed and undelegated (primary tree) or
/// just unmapped (auxiliary trees), unprotected mappings are removed,
/// and emptied child tables are destroyed bottom-up with their granules
/// returned to the pool.
///
/// `protected_top` is the first address above the protected space;
/// entries at or above it are unprotected aliases.
pub fn tear_down_tree<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    rd: u64,
    tree: u64,
    level: i8,
    start: u64,
    end: u64,
    protected_top: u64,
) -> Result<()> {
    let map_size = rtt_map_size(level);
    let mut addr = align_down(start, map_size);
    let end = align_up(end, map_size);
    while addr < end {
        let next = addr + map_size;
        let entry = rtt::read_entry(rmi, rd, addr, level, tree)?;
        if entry.walk_level < level {
            // Hole above this level; skip its whole reach.
            let hole = rtt_map_size(entry.walk_level);
            addr = align_down(addr, hole) + hole;
            continue;
        }
        match entry.state {
            Hipas::Unassigned => {}
            Hipas::Assigned if addr < protected_top => {
                if tree == PRIMARY_TREE {
                    let (data, _) = rmi.data_destroy(rd, addr)?;
                    granule::undelegate(rmi, tracker, data)?;
                } else {
                    rmi.rtt_aux_unmap_protected(rd, addr, tree)?;
                }
            }
            Hipas::Assigned => {
                if tree == PRIMARY_TREE {
                    rmi.rtt_unmap_unprotected(rd, addr, level)?;
                } else {
                    rmi.rtt_aux_unmap_unprotected(rd, addr, tree)?;
                }
            }
            Hipas::Table => {
                tear_down_tree(
                    rmi,
                    pool,
                    tracker,
                    rd,
                    tree,
                    level + 1,
                    addr,
                    next,
                    protected_top,
                )?;
                rtt::destroy(rmi, pool, tracker, rd, addr, level + 1, tree)?;
            }
        }
        addr = next;
    }
    Ok(())
}
