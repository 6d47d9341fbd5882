// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The monitor call primitive.
//!
//! Every operation in this crate is one fixed-identifier call carrying up
//! to seventeen 64-bit argument words and returning up to eighteen result
//! words. The first result word is always a status value: status class in
//! the low byte, auxiliary index (for the RTT classes, the level at which
//! a walk stopped) in the next byte.
//!
//! How that call reaches the monitor is not this crate's concern: on real
//! hardware it is an SMC instruction issued by the platform layer, in
//! tests it is the in-process model in [`crate::mock`].

/// Maximum argument words one call carries (past the function identifier).
pub const CALL_ARG_WORDS: usize = 17;

/// Maximum result words one call returns.
pub const CALL_RET_WORDS: usize = 18;

/// Argument registers of one monitor call.
pub type CallArgs = [u64; CALL_ARG_WORDS];

/// Result registers of one monitor call. Index 0 is the status word.
pub type CallRets = [u64; CALL_RET_WORDS];

/// The conduit to the monitor.
///
/// Implementations perform exactly one call and block until the monitor
/// responds; there is no timeout or cancellation at this layer.
pub trait Monitor {
    /// Issues the call identified by `fid` with the given argument words.
    fn call(&mut self, fid: u64, args: &CallArgs) -> CallRets;
}

impl<M: Monitor + ?Sized> Monitor for &mut M {
    fn call(&mut self, fid: u64, args: &CallArgs) -> CallRets {
        (**self).call(fid, args)
    }
}
