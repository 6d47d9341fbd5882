// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Execution-context entry and the host-side service loop.
//!
//! [`enter`] runs one context until it produces an exit the host cannot
//! service itself. Content-state changes, permission changes, plane
//! stage-2 faults, power requests and host calls are handled in the
//! loop; everything else is returned to the caller.

use crate::error::{Error, Result};
use crate::granule::GranuleTracker;
use crate::pool::PagePool;
use crate::realm::{Realm, RealmState, RipasReply};
use crate::region;
use crate::rmi::Rmi;
use crate::rtt::{self, PRIMARY_TREE};
use crate::smc::Monitor;

pub mod run;


use run::{ExitReason, RecEntryFlags, RecExit};

/// Host-call sub-commands a realm may issue.
pub mod host_call {
    /// Ask for the address of the shared buffer.
    pub const GET_SHARED_BUFFER: u64 = 1;
    /// The payload finished successfully.
    pub const EXIT_SUCCESS: u64 = 2;
    /// The payload failed.
    pub const EXIT_FAILED: u64 = 3;
    /// Print the NUL-terminated string in the shared buffer.
    pub const PRINT: u64 = 4;
}

/// Power requests a realm may raise.
mod psci {
    pub const CPU_ON: u64 = 0xC400_0003;
    pub const AFFINITY_INFO: u64 = 0xC400_0004;
    pub const SYSTEM_OFF: u64 = 0x8400_0008;

    pub const SUCCESS: u64 = 0;
    pub const NOT_SUPPORTED: u64 = u64::MAX;
}

/// Longest print a single host call may carry.
const PRINT_MAX: usize = 512;

/// Exception class of a lower-EL data abort.
const ESR_EC_DATA_ABORT: u64 = 0x24;
/// Fault status codes of a stage-2 translation fault, by level.
const DFSC_TRANSLATION: core::ops::RangeInclusive<u64> = 0x4..=0x7;

/// How an [`enter`] loop ended.
#[derive(Debug, Clone, Copy)]
pub enum RecOutcome {
    /// The payload reported success.
    PayloadSuccess,
    /// The payload reported failure.
    PayloadFailed,
    /// The realm requested system shutdown.
    SystemOff,
    /// An exit the host does not service; the decoded record is
    /// returned for the caller to act on.
    Exited(RecExit),
}

/// Enters context `rec_idx` of `realm` and services its exits until the
/// payload finishes or an unhandled exit occurs.
pub fn enter<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    realm: &mut Realm,
    rec_idx: usize,
) -> Result<RecOutcome> {
    if realm.state != RealmState::Active {
        return Err(Error::State(realm.state));
    }
    let rec = realm.recs.get(rec_idx).ok_or(Error::NoSuchRec(rec_idx))?;
    if !rec.runnable {
        return Err(Error::NoSuchRec(rec_idx));
    }
    let (rec_granule, run_page) = (rec.granule, rec.run_page);

    let mut flags = RecEntryFlags::empty();
    let mut ripas_rejected = false;

    loop {
        run::write_entry_flags(pool, run_page, flags);
        flags = RecEntryFlags::empty();

        rmi.rec_enter(rec_granule, run_page)?;
        let exit = RecExit::read(pool, run_page)
            .ok_or(Error::Protocol("exit reason outside the protocol"))?;

        match exit.reason {
            ExitReason::RipasChange => {
                if realm.ripas_reply == RipasReply::RejectFirst && !ripas_rejected {
                    ripas_rejected = true;
                    flags |= RecEntryFlags::RIPAS_RESPONSE_REJECT;
                } else {
                    region::set_ripas(
                        rmi,
                        pool,
                        tracker,
                        realm.rd,
                        rec_granule,
                        exit.ripas_base,
                        exit.ripas_base + exit.ripas_size,
                    )?;
                }
            }
            ExitReason::S2apChange => {
                let tree = if realm.rtt_tree_per_plane {
                    exit.plane
                } else {
                    PRIMARY_TREE
                };
                region::set_s2ap(
                    rmi,
                    pool,
                    tracker,
                    realm.rd,
                    rec_granule,
                    exit.s2ap_base,
                    exit.s2ap_top,
                    tree,
                )?;
            }
            ExitReason::HostCall => match exit.imm {
                host_call::GET_SHARED_BUFFER => {
                    run::write_entry_gpr(pool, run_page, 0, realm.shared_page_realm_view());
                }
                host_call::PRINT => {
                    print_shared_buffer(pool, realm.shared_page);
                }
                host_call::EXIT_SUCCESS => return Ok(RecOutcome::PayloadSuccess),
                host_call::EXIT_FAILED => return Ok(RecOutcome::PayloadFailed),
                _ => return Err(Error::Protocol("unknown host call")),
            },
            ExitReason::Psci => match exit.gprs[0] {
                psci::CPU_ON => {
                    let target = exit.gprs[1];
                    let status = wake_rec(realm, target);
                    let target_granule = realm
                        .rec_index_by_mpidr(target)
                        .map_or(0, |i| realm.recs[i].granule);
                    rmi.psci_complete(rec_granule, target_granule, status)?;
                }
                psci::AFFINITY_INFO => {
                    let target = exit.gprs[1];
                    let (granule, status) = match realm.rec_index_by_mpidr(target) {
                        Some(i) => (
                            realm.recs[i].granule,
                            u64::from(!realm.recs[i].runnable),
                        ),
                        None => (0, psci::NOT_SUPPORTED),
                    };
                    rmi.psci_complete(rec_granule, granule, status)?;
                }
                psci::SYSTEM_OFF => {
                    realm.state = RealmState::SystemOff;
                    return Ok(RecOutcome::SystemOff);
                }
                _ => {
                    rmi.psci_complete(rec_granule, 0, psci::NOT_SUPPORTED)?;
                }
            },
            ExitReason::Sync if is_plane_fault(realm, &exit) => {
                rtt::aux_map_protected(
                    rmi,
                    pool,
                    tracker,
                    realm.rd,
                    crate::addr::align_down(exit.fault_addr(), crate::addr::GRANULE_SIZE),
                    exit.plane,
                )?;
            }
            ExitReason::Sync
            | ExitReason::Irq
            | ExitReason::Fiq
            | ExitReason::SError
            | ExitReason::VdevRequest
            | ExitReason::VdevComm => return Ok(RecOutcome::Exited(exit)),
        }
    }
}

/// A stage-2 translation fault raised by an auxiliary plane whose tree
/// simply lacks the mapping the primary tree already has. The host can
/// resolve it by mirroring the page.
fn is_plane_fault(realm: &Realm, exit: &RecExit) -> bool {
    if !realm.rtt_tree_per_plane || exit.plane == 0 {
        return false;
    }
    let ec = (exit.esr >> 26) & 0x3F;
    let dfsc = exit.esr & 0x3F;
    if ec != ESR_EC_DATA_ABORT || !DFSC_TRANSLATION.contains(&dfsc) {
        return false;
    }
    let addr = exit.fault_addr();
    addr >= realm.par_base && addr < realm.par_base + realm.par_size
}

/// Marks the context with affinity `mpidr` wakeable.
fn wake_rec(realm: &mut Realm, mpidr: u64) -> u64 {
    match realm.rec_index_by_mpidr(mpidr) {
        Some(i) => {
            realm.recs[i].runnable = true;
            psci::SUCCESS
        }
        None => psci::NOT_SUPPORTED,
    }
}

/// Logs the NUL-terminated string at the start of the shared buffer and
/// consumes it.
fn print_shared_buffer<P: PagePool>(pool: &mut P, shared_page: u64) {
    let mut buf = [0u8; PRINT_MAX];
    pool.read(shared_page, &mut buf);
    let len = buf.iter().position(|&b| b == 0).unwrap_or(PRINT_MAX);
    match core::str::from_utf8(&buf[..len]) {
        Ok(s) => log::info!("realm: {s}"),
        Err(_) => log::info!("realm: {} bytes of non-utf8 output", len),
    }
    pool.write(shared_page, &[0]);
}
