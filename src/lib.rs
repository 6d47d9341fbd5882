// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # realm-host
//!
//! Host-side control model for the Realm Management Interface (RMI).
//!
//! This crate drives a confidential-computing monitor, purely through a
//! narrow call/response protocol, to:
//! - delegate physical memory granules between the normal and realm worlds
//! - build and tear down realms and their second-stage translation trees
//! - populate realm memory through its content/permission state machine
//! - enter realm execution contexts and service their exits to completion
//!
//! The two collaborators the crate depends on are injected as traits: the
//! call primitive ([`smc::Monitor`]) and the page allocator
//! ([`pool::PagePool`]). The [`mock`] module provides in-process
//! implementations of both so the whole engine runs on any host.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod addr;
pub mod error;
pub mod granule;
pub mod mock;
pub mod pool;
pub mod realm;
pub mod rec;
pub mod region;
pub mod rmi;
pub mod rtt;
pub mod smc;

pub use error::{Error, Result};
pub use rmi::RmiError;

/// Crate version.
pub const VERSION: &str = match option_env!("REALM_HOST_VERSION") {
    Some(v) => v,
    None => "unknown",
};
