// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Granule and translation-tree address arithmetic.
//!
//! A granule is the fixed 4 KiB unit of physical memory the monitor
//! tracks. Translation-tree levels resolve 9 bits each on top of the
//! granule offset; level 3 maps single granules, level -1 exists only
//! with extended (52-bit) addressing.

/// log2 of the granule size.
pub const GRANULE_SHIFT: u32 = 12;

/// Size of one granule in bytes.
pub const GRANULE_SIZE: u64 = 1 << GRANULE_SHIFT;

/// Bits resolved by one translation level.
pub const RTT_STRIDE: u32 = GRANULE_SHIFT - 3;

/// The deepest translation level; entries here map single granules.
pub const RTT_PAGE_LEVEL: i8 = 3;

/// The shallowest translation level under extended addressing.
pub const RTT_MIN_LEVEL: i8 = -1;

/// Returns the size of the address range one entry at `level` covers.
#[must_use]
pub const fn rtt_map_size(level: i8) -> u64 {
    1 << ((RTT_PAGE_LEVEL - level) as u32 * RTT_STRIDE + GRANULE_SHIFT)
}

/// Aligns `addr` down to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Aligns `addr` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Checks `addr` is a multiple of `align` (a power of two).
#[must_use]
pub const fn is_aligned(addr: u64, align: u64) -> bool {
    addr & (align - 1) == 0
}

// Level geometry is load-bearing for every walk in the crate.
const _: () = {
    assert!(rtt_map_size(3) == 0x1000);
    assert!(rtt_map_size(2) == 0x20_0000);
    assert!(rtt_map_size(1) == 0x4000_0000);
    assert!(rtt_map_size(0) == 0x80_0000_0000);
    assert!(rtt_map_size(-1) == 1 << 48);
};
