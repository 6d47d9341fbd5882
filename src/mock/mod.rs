// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! In-process monitor model for tests and development.
//!
//! [`Arena`] is a flat slab of fake physical memory shared between the
//! host-side [`SharedPool`] and the [`MockRmm`] monitor model, so data
//! written by one side is visible to the other exactly as it would be
//! through real memory. [`MockRmm`] implements the full call surface
//! with granule-state and tree-shape enforcement, which makes ownership
//! bugs in the engine fail loudly instead of silently.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::addr::{is_aligned, GRANULE_SIZE};
use crate::pool::PagePool;

mod rmm;

pub use rmm::{MockRmm, ScriptedExit};

/// Default base of the fake physical address space.
pub const ARENA_BASE: u64 = 0x8000_0000;

/// Flat page-granular memory with a bump allocator and a free list.
#[derive(Debug)]
pub struct Arena {
    base: u64,
    memory: Vec<u8>,
    next: u64,
    free: BTreeMap<u64, usize>,
}

impl Arena {
    /// An arena of `pages` granules starting at [`ARENA_BASE`].
    #[must_use]
    pub fn new(pages: usize) -> Self {
        Self {
            base: ARENA_BASE,
            memory: vec![0; pages * GRANULE_SIZE as usize],
            next: ARENA_BASE,
            free: BTreeMap::new(),
        }
    }

    /// Whether `[addr, addr + len)` lies inside the arena.
    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr + len <= self.base + self.memory.len() as u64
    }

    fn offset(&self, addr: u64, len: usize) -> usize {
        assert!(
            self.contains(addr, len as u64),
            "access outside the arena: {addr:#x}+{len:#x}"
        );
        (addr - self.base) as usize
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let off = self.offset(addr, buf.len());
        buf.copy_from_slice(&self.memory[off..off + buf.len()]);
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let off = self.offset(addr, bytes.len());
        self.memory[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Copies one granule within the arena.
    pub fn copy_page(&mut self, from: u64, to: u64) {
        let src = self.offset(from, GRANULE_SIZE as usize);
        let dst = self.offset(to, GRANULE_SIZE as usize);
        self.memory.copy_within(src..src + GRANULE_SIZE as usize, dst);
    }

    fn alloc_pages(&mut self, count: usize) -> Option<u64> {
        debug_assert!(count > 0);
        // First-fit from the free list, bump otherwise.
        let found = self
            .free
            .iter()
            .find(|&(_, &n)| n >= count)
            .map(|(&base, &n)| (base, n));
        if let Some((base, n)) = found {
            self.free.remove(&base);
            if n > count {
                self.free.insert(base + (count as u64) * GRANULE_SIZE, n - count);
            }
            self.zero_pages(base, count);
            return Some(base);
        }
        let bytes = (count as u64) * GRANULE_SIZE;
        if !self.contains(self.next, bytes) {
            return None;
        }
        let base = self.next;
        self.next += bytes;
        Some(base)
    }

    fn free_pages(&mut self, base: u64, count: usize) {
        assert!(is_aligned(base, GRANULE_SIZE));
        assert!(self.contains(base, (count as u64) * GRANULE_SIZE));
        let prev = self.free.insert(base, count);
        assert!(prev.is_none(), "double free at {base:#x}");
    }

    fn zero_pages(&mut self, base: u64, count: usize) {
        let off = self.offset(base, count * GRANULE_SIZE as usize);
        self.memory[off..off + count * GRANULE_SIZE as usize].fill(0);
    }
}

/// Handle to an arena shared between a pool and a monitor model.
pub type SharedArena = Rc<RefCell<Arena>>;

/// Creates an arena of `pages` granules plus a pool and view over it.
#[must_use]
pub fn shared_arena(pages: usize) -> (SharedArena, SharedPool) {
    let arena = Rc::new(RefCell::new(Arena::new(pages)));
    let pool = SharedPool {
        arena: Rc::clone(&arena),
    };
    (arena, pool)
}

/// [`PagePool`] backed by a shared [`Arena`].
#[derive(Debug, Clone)]
pub struct SharedPool {
    arena: SharedArena,
}

impl PagePool for SharedPool {
    fn alloc_pages(&mut self, count: usize) -> Option<u64> {
        self.arena.borrow_mut().alloc_pages(count)
    }

    fn free_pages(&mut self, base: u64, count: usize) {
        self.arena.borrow_mut().free_pages(base, count);
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        self.arena.borrow().read(addr, buf);
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) {
        self.arena.borrow_mut().write(addr, bytes);
    }
}
