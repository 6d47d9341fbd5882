// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Crate-wide error types.
//!
//! [`crate::rmi::RmiError`] is the decoded status word of a failed
//! monitor call; [`Error`] wraps it together with the failures that can
//! only originate on the host side. Only the RTT status classes are ever
//! recovered from automatically (the missing-table repair path); every
//! other error propagates to the caller unchanged.

use crate::realm::RealmState;
use crate::rmi::RmiError;

/// Errors surfaced by the host-side engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A monitor call failed and was not repairable.
    #[error("monitor call failed: {0}")]
    Rmi(#[from] RmiError),

    /// The page pool could not satisfy an allocation.
    #[error("out of page memory")]
    OutOfMemory,

    /// The requested realm configuration was rejected up front.
    #[error("invalid realm configuration: {0}")]
    Config(&'static str),

    /// The realm is not in the state the operation requires.
    #[error("operation not legal in realm state {0:?}")]
    State(RealmState),

    /// An address violated the operation's alignment contract.
    #[error("misaligned address {0:#x}")]
    Misaligned(u64),

    /// The monitor returned a result the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// No execution context with the given index or affinity exists.
    #[error("no such rec: {0}")]
    NoSuchRec(usize),
}

/// Crate-wide result type.
pub type Result<T> = core::result::Result<T, Error>;
