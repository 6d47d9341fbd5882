// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Fixed layouts of the context parameter block and the run record.
//!
//! The run record is one granule the host shares with the monitor on
//! every entry: the entry half (host to monitor) starts at offset 0,
//! the exit half (monitor to host) at [`EXIT_BASE`]. Both halves are
//! plain little-endian words at fixed offsets.

use bitflags::bitflags;

use crate::addr::GRANULE_SIZE;
use crate::pool::{read_u64, write_u64, PagePool};
use crate::realm::RecConfig;

/// Context parameter block offsets.
pub mod rec_params {
    pub const FLAGS: u64 = 0x0;
    pub const MPIDR: u64 = 0x100;
    pub const PC: u64 = 0x200;
    pub const GPRS: u64 = 0x300;
    pub const NUM_AUX: u64 = 0x800;
    pub const AUX: u64 = 0x808;

    /// The context may be entered without a wake-up call.
    pub const FLAG_RUNNABLE: u64 = 1 << 0;

    /// Seedable general registers.
    pub const NUM_GPRS: usize = 8;
    /// Auxiliary granule slots in the block.
    pub const NUM_AUX_SLOTS: usize = 16;
}

/// Entry-half offsets.
pub mod entry {
    pub const FLAGS: u64 = 0x0;
    pub const GPRS: u64 = 0x200;
    pub const GICV3_HCR: u64 = 0x300;
    pub const GICV3_LRS: u64 = 0x308;
}

/// Start of the exit half within the run record.
pub const EXIT_BASE: u64 = 0x800;

/// Exit-half offsets, relative to the run record base.
pub mod exit {
    use super::EXIT_BASE;

    pub const REASON: u64 = EXIT_BASE;
    pub const ESR: u64 = EXIT_BASE + 0x100;
    pub const FAR: u64 = EXIT_BASE + 0x108;
    pub const HPFAR: u64 = EXIT_BASE + 0x110;
    pub const GPRS: u64 = EXIT_BASE + 0x200;
    pub const RIPAS_BASE: u64 = EXIT_BASE + 0x500;
    pub const RIPAS_SIZE: u64 = EXIT_BASE + 0x508;
    pub const RIPAS_VALUE: u64 = EXIT_BASE + 0x510;
    pub const S2AP_BASE: u64 = EXIT_BASE + 0x518;
    pub const S2AP_TOP: u64 = EXIT_BASE + 0x520;
    pub const IMM: u64 = EXIT_BASE + 0x600;
    pub const PLANE: u64 = EXIT_BASE + 0x608;
    pub const PMU_OVF: u64 = EXIT_BASE + 0x700;
}

const _: () = {
    assert!(exit::PMU_OVF + 8 <= GRANULE_SIZE);
    assert!(entry::GICV3_LRS + 16 * 8 <= EXIT_BASE);
    assert!(rec_params::AUX + (rec_params::NUM_AUX_SLOTS as u64) * 8 <= GRANULE_SIZE);
};

bitflags! {
    /// Entry flags the host sets before re-entering a context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecEntryFlags: u64 {
        const EMULATED_MMIO = 1 << 0;
        const INJECT_SEA = 1 << 1;
        const TRAP_WFI = 1 << 2;
        const TRAP_WFE = 1 << 3;
        /// The preceding content-state change request was rejected.
        const RIPAS_RESPONSE_REJECT = 1 << 4;
    }
}

/// Why a context handed control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Sync,
    Irq,
    Fiq,
    Psci,
    RipasChange,
    HostCall,
    SError,
    S2apChange,
    VdevRequest,
    VdevComm,
}

impl ExitReason {
    /// Decodes the wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Sync),
            1 => Some(Self::Irq),
            2 => Some(Self::Fiq),
            3 => Some(Self::Psci),
            4 => Some(Self::RipasChange),
            5 => Some(Self::HostCall),
            6 => Some(Self::SError),
            7 => Some(Self::S2apChange),
            8 => Some(Self::VdevRequest),
            9 => Some(Self::VdevComm),
            _ => None,
        }
    }
}

/// Decoded exit half of a run record.
#[derive(Debug, Clone, Copy)]
pub struct RecExit {
    pub reason: ExitReason,
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    /// The first eight exit registers; host calls pass arguments here.
    pub gprs: [u64; 8],
    pub ripas_base: u64,
    pub ripas_size: u64,
    pub ripas_value: u64,
    pub s2ap_base: u64,
    pub s2ap_top: u64,
    /// Host-call sub-command.
    pub imm: u64,
    /// Plane the exit originated from.
    pub plane: u64,
    pub pmu_overflow: u64,
}

impl RecExit {
    /// Reads and decodes the exit half at `run_page`. `None` when the
    /// reason word is outside the protocol.
    pub fn read<P: PagePool + ?Sized>(pool: &P, run_page: u64) -> Option<Self> {
        let reason = ExitReason::from_raw(read_u64(pool, run_page + exit::REASON))?;
        let mut gprs = [0u64; 8];
        for (i, g) in gprs.iter_mut().enumerate() {
            *g = read_u64(pool, run_page + exit::GPRS + 8 * i as u64);
        }
        Some(Self {
            reason,
            esr: read_u64(pool, run_page + exit::ESR),
            far: read_u64(pool, run_page + exit::FAR),
            hpfar: read_u64(pool, run_page + exit::HPFAR),
            gprs,
            ripas_base: read_u64(pool, run_page + exit::RIPAS_BASE),
            ripas_size: read_u64(pool, run_page + exit::RIPAS_SIZE),
            ripas_value: read_u64(pool, run_page + exit::RIPAS_VALUE),
            s2ap_base: read_u64(pool, run_page + exit::S2AP_BASE),
            s2ap_top: read_u64(pool, run_page + exit::S2AP_TOP),
            imm: read_u64(pool, run_page + exit::IMM),
            plane: read_u64(pool, run_page + exit::PLANE),
            pmu_overflow: read_u64(pool, run_page + exit::PMU_OVF),
        })
    }

    /// The faulting address of a stage-2 fault, reconstructed from the
    /// fault address register pair.
    #[must_use]
    pub fn fault_addr(&self) -> u64 {
        ((self.hpfar >> 4) << 12) | (self.far & (GRANULE_SIZE - 1))
    }
}

/// Sets the entry flags for the next entry.
pub fn write_entry_flags<P: PagePool>(pool: &mut P, run_page: u64, flags: RecEntryFlags) {
    write_u64(pool, run_page + entry::FLAGS, flags.bits());
}

/// Seeds one entry general register for the next entry.
pub fn write_entry_gpr<P: PagePool>(pool: &mut P, run_page: u64, idx: usize, value: u64) {
    debug_assert!(idx < 31);
    write_u64(pool, run_page + entry::GPRS + 8 * idx as u64, value);
}

/// Populates a context parameter block.
pub fn write_rec_params<P: PagePool>(
    pool: &mut P,
    params_page: u64,
    config: &RecConfig,
    mpidr: u64,
    aux_base: u64,
    aux_count: usize,
) {
    debug_assert!(aux_count <= rec_params::NUM_AUX_SLOTS);
    let flags = if config.runnable {
        rec_params::FLAG_RUNNABLE
    } else {
        0
    };
    write_u64(pool, params_page + rec_params::FLAGS, flags);
    write_u64(pool, params_page + rec_params::MPIDR, mpidr);
    write_u64(pool, params_page + rec_params::PC, config.pc);
    for (i, &g) in config.gprs.iter().enumerate() {
        write_u64(pool, params_page + rec_params::GPRS + 8 * i as u64, g);
    }
    write_u64(pool, params_page + rec_params::NUM_AUX, aux_count as u64);
    for i in 0..aux_count {
        write_u64(
            pool,
            params_page + rec_params::AUX + 8 * i as u64,
            aux_base + GRANULE_SIZE * i as u64,
        );
    }
}
