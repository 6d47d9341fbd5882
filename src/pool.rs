// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The host page allocator boundary.
//!
//! Granules handed to the monitor (descriptors, tree nodes, execution
//! contexts, data pages, parameter blocks) come from a normal-world page
//! pool owned by the caller. The pool also mediates all host reads and
//! writes of those pages: once a granule is delegated it is opaque to the
//! normal world, and the engine only ever touches pages it still owns.

/// Allocator and accessor for normal-world page memory.
pub trait PagePool {
    /// Allocates `count` contiguous zeroed granules, returning the base
    /// physical address, or `None` when the pool is exhausted.
    fn alloc_pages(&mut self, count: usize) -> Option<u64>;

    /// Returns `count` granules starting at `base` to the pool.
    fn free_pages(&mut self, base: u64, count: usize);

    /// Reads bytes at an absolute physical address.
    fn read(&self, addr: u64, buf: &mut [u8]);

    /// Writes bytes at an absolute physical address.
    fn write(&mut self, addr: u64, bytes: &[u8]);
}

impl<P: PagePool + ?Sized> PagePool for &mut P {
    fn alloc_pages(&mut self, count: usize) -> Option<u64> {
        (**self).alloc_pages(count)
    }

    fn free_pages(&mut self, base: u64, count: usize) {
        (**self).free_pages(base, count);
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        (**self).read(addr, buf);
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) {
        (**self).write(addr, bytes);
    }
}

/// Reads one little-endian u64 at `addr`.
#[must_use]
pub fn read_u64<P: PagePool + ?Sized>(pool: &P, addr: u64) -> u64 {
    let mut buf = [0u8; 8];
    pool.read(addr, &mut buf);
    u64::from_le_bytes(buf)
}

/// Writes one little-endian u64 at `addr`.
pub fn write_u64<P: PagePool + ?Sized>(pool: &mut P, addr: u64, value: u64) {
    pool.write(addr, &value.to_le_bytes());
}
