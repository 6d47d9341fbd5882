// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Layout of the realm parameter block.
//!
//! One granule, populated by the host and consumed exactly once by
//! realm creation. Fields sit at fixed offsets; everything not written
//! stays zero (the page comes zeroed from the pool).

use bitflags::bitflags;

use crate::addr::GRANULE_SIZE;

bitflags! {
    /// Feature selection flags (offset [`FLAGS0`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RealmFlags0: u64 {
        const LPA2 = 1 << 0;
        const SVE = 1 << 1;
        const PMU = 1 << 2;
    }
}

bitflags! {
    /// Plane configuration flags (offset [`FLAGS1`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RealmFlags1: u64 {
        /// Each plane gets its own translation tree.
        const RTT_TREE_PER_PLANE = 1 << 0;
        /// Permissions are looked up through indirection registers.
        const S2AP_INDIRECT = 1 << 1;
    }
}

pub const FLAGS0: u64 = 0x0;
pub const S2SZ: u64 = 0x8;
pub const SVE_VL: u64 = 0x10;
pub const NUM_BPS: u64 = 0x18;
pub const NUM_WPS: u64 = 0x20;
pub const PMU_NUM_CTRS: u64 = 0x28;
pub const HASH_ALGO: u64 = 0x30;
pub const FLAGS1: u64 = 0x38;
pub const NUM_AUX_PLANES: u64 = 0x40;
pub const RPV: u64 = 0x400;
pub const VMID: u64 = 0x800;
pub const RTT_BASE: u64 = 0x808;
pub const RTT_LEVEL_START: u64 = 0x810;
pub const RTT_NUM_START: u64 = 0x818;
/// Three consecutive entries, one per possible auxiliary plane.
pub const AUX_VMID: u64 = 0x820;
/// Three consecutive entries, one per possible auxiliary tree.
pub const AUX_RTT_BASE: u64 = 0x840;

/// Bytes of the realm personalization value.
pub const RPV_SIZE: usize = 64;

/// Hash algorithm field values.
pub const HASH_SHA_256: u64 = 0;
pub const HASH_SHA_512: u64 = 1;

const _: () = {
    assert!(RPV < VMID);
    assert!(AUX_RTT_BASE + 8 * 3 <= GRANULE_SIZE);
};
