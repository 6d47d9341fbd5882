// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Typed wrappers over the raw monitor call protocol.
//!
//! One thin function per monitor operation: marshal the argument words,
//! issue the call through the injected [`Monitor`], decode the status
//! word and unpack any result words. No retry or bookkeeping happens at
//! this layer; that is the job of the modules above it.

use crate::rtt::{Hipas, Ripas, RttEntry};
use crate::smc::{CallArgs, CallRets, Monitor, CALL_ARG_WORDS};


/// Interface revision this crate speaks.
pub const ABI_VERSION_MAJOR: u64 = 1;
/// Minor part of [`ABI_VERSION_MAJOR`].
pub const ABI_VERSION_MINOR: u64 = 1;

/// Packs a major/minor pair into a version word.
#[must_use]
pub const fn abi_version(major: u64, minor: u64) -> u64 {
    (major << 16) | minor
}

/// Function identifiers: SMC64 fast calls in the standard service range.
pub mod fid {
    const BASE: u64 = 0xC400_0150;

    const fn at(offset: u64) -> u64 {
        BASE + offset
    }

    pub const VERSION: u64 = at(0x00);
    pub const GRANULE_DELEGATE: u64 = at(0x01);
    pub const GRANULE_UNDELEGATE: u64 = at(0x02);
    pub const DATA_CREATE: u64 = at(0x03);
    pub const DATA_CREATE_UNKNOWN: u64 = at(0x04);
    pub const DATA_DESTROY: u64 = at(0x05);
    pub const REALM_ACTIVATE: u64 = at(0x07);
    pub const REALM_CREATE: u64 = at(0x08);
    pub const REALM_DESTROY: u64 = at(0x09);
    pub const REC_CREATE: u64 = at(0x0A);
    pub const REC_DESTROY: u64 = at(0x0B);
    pub const REC_ENTER: u64 = at(0x0C);
    pub const RTT_CREATE: u64 = at(0x0D);
    pub const RTT_DESTROY: u64 = at(0x0E);
    pub const RTT_MAP_UNPROTECTED: u64 = at(0x0F);
    pub const RTT_READ_ENTRY: u64 = at(0x11);
    pub const RTT_UNMAP_UNPROTECTED: u64 = at(0x12);
    pub const PSCI_COMPLETE: u64 = at(0x14);
    pub const FEATURES: u64 = at(0x15);
    pub const RTT_FOLD: u64 = at(0x16);
    pub const REC_AUX_COUNT: u64 = at(0x17);
    pub const RTT_INIT_RIPAS: u64 = at(0x18);
    pub const RTT_SET_RIPAS: u64 = at(0x19);
    pub const RTT_AUX_CREATE: u64 = at(0x30);
    pub const RTT_AUX_DESTROY: u64 = at(0x31);
    pub const RTT_AUX_FOLD: u64 = at(0x32);
    pub const RTT_AUX_MAP_PROTECTED: u64 = at(0x33);
    pub const RTT_AUX_UNMAP_PROTECTED: u64 = at(0x34);
    pub const RTT_AUX_MAP_UNPROTECTED: u64 = at(0x35);
    pub const RTT_AUX_UNMAP_UNPROTECTED: u64 = at(0x36);
    pub const RTT_SET_S2AP: u64 = at(0x3B);
}

/// Status classes a monitor call can return, with their auxiliary index.
///
/// The RTT classes carry the translation level at which a walk stopped;
/// they are the only classes the engine repairs automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RmiError {
    /// The value of a command input caused the command to fail.
    #[error("malformed input value")]
    Input,
    /// An attribute of a realm did not match the expected value.
    #[error("realm attribute mismatch (index {0})")]
    Realm(u8),
    /// An attribute of an execution context did not match.
    #[error("rec attribute mismatch")]
    Rec,
    /// A primary-tree walk terminated early or hit an unexpected entry.
    #[error("rtt walk terminated at level {0}")]
    Rtt(i8),
    /// A device state mismatch.
    #[error("device state mismatch (index {0})")]
    Device(u8),
    /// An auxiliary-tree walk terminated early.
    #[error("auxiliary rtt walk terminated at level {0}")]
    RttAux(i8),
    /// The monitor does not implement the command.
    #[error("not supported by the monitor")]
    NotSupported,
    /// A status class outside the protocol.
    #[error("unknown status {code} (index {index})")]
    Unknown { code: u8, index: u8 },
}

/// Result of a single monitor call.
pub type RmiResult<T = ()> = core::result::Result<T, RmiError>;

mod status_code {
    pub const SUCCESS: u8 = 0;
    pub const ERROR_INPUT: u8 = 1;
    pub const ERROR_REALM: u8 = 2;
    pub const ERROR_REC: u8 = 3;
    pub const ERROR_RTT: u8 = 4;
    pub const ERROR_DEVICE: u8 = 5;
    pub const ERROR_RTT_AUX: u8 = 6;
    pub const ERROR_NOT_SUPPORTED: u8 = 7;
}

/// Decodes the first result word of a call.
pub fn decode_status(ret0: u64) -> RmiResult {
    let code = (ret0 & 0xFF) as u8;
    let index = ((ret0 >> 8) & 0xFF) as u8;
    match code {
        status_code::SUCCESS => Ok(()),
        status_code::ERROR_INPUT => Err(RmiError::Input),
        status_code::ERROR_REALM => Err(RmiError::Realm(index)),
        status_code::ERROR_REC => Err(RmiError::Rec),
        status_code::ERROR_RTT => Err(RmiError::Rtt(index as i8)),
        status_code::ERROR_DEVICE => Err(RmiError::Device(index)),
        status_code::ERROR_RTT_AUX => Err(RmiError::RttAux(index as i8)),
        status_code::ERROR_NOT_SUPPORTED => Err(RmiError::NotSupported),
        _ => Err(RmiError::Unknown { code, index }),
    }
}

/// Packs an error back into a status word. Used by monitor models.
#[must_use]
pub fn encode_status(result: RmiResult) -> u64 {
    let (code, index) = match result {
        Ok(()) => (status_code::SUCCESS, 0),
        Err(RmiError::Input) => (status_code::ERROR_INPUT, 0),
        Err(RmiError::Realm(i)) => (status_code::ERROR_REALM, i),
        Err(RmiError::Rec) => (status_code::ERROR_REC, 0),
        Err(RmiError::Rtt(l)) => (status_code::ERROR_RTT, l as u8),
        Err(RmiError::Device(i)) => (status_code::ERROR_DEVICE, i),
        Err(RmiError::RttAux(l)) => (status_code::ERROR_RTT_AUX, l as u8),
        Err(RmiError::NotSupported) => (status_code::ERROR_NOT_SUPPORTED, 0),
        Err(RmiError::Unknown { code, index }) => (code, index),
    };
    u64::from(code) | (u64::from(index) << 8)
}

/// The packed capability word returned by feature discovery (index 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureReg0(pub u64);

impl FeatureReg0 {
    pub const LPA2: u64 = 1 << 8;
    pub const SVE_EN: u64 = 1 << 9;
    pub const PMU_EN: u64 = 1 << 22;
    pub const HASH_SHA_256: u64 = 1 << 28;
    pub const HASH_SHA_512: u64 = 1 << 29;
    pub const S2AP_INDIRECT: u64 = 1 << 36;

    /// Tree configurations: only one shared tree across planes.
    pub const PLANE_RTT_SINGLE: u64 = 0;
    /// Tree configurations: only one auxiliary tree per plane.
    pub const PLANE_RTT_AUX: u64 = 1;
    /// Tree configurations: the monitor supports both.
    pub const PLANE_RTT_AUX_SINGLE: u64 = 2;

    fn field(self, shift: u32, width: u32) -> u64 {
        (self.0 >> shift) & ((1 << width) - 1)
    }

    /// Supported protected address width in bits.
    #[must_use]
    pub fn s2sz(self) -> u32 {
        self.field(0, 8) as u32
    }

    /// Supported SVE vector length encoding.
    #[must_use]
    pub fn sve_vl(self) -> u8 {
        self.field(10, 4) as u8
    }

    /// Number of implemented breakpoints.
    #[must_use]
    pub fn num_bps(self) -> u8 {
        self.field(14, 4) as u8
    }

    /// Number of implemented watchpoints.
    #[must_use]
    pub fn num_wps(self) -> u8 {
        self.field(18, 4) as u8
    }

    /// Number of implemented PMU counters.
    #[must_use]
    pub fn pmu_num_ctrs(self) -> u8 {
        self.field(23, 5) as u8
    }

    /// Maximum number of auxiliary planes.
    #[must_use]
    pub fn max_aux_planes(self) -> u8 {
        self.field(30, 4) as u8
    }

    /// Supported tree configuration (one of the `PLANE_RTT_*` values).
    #[must_use]
    pub fn plane_rtt(self) -> u64 {
        self.field(34, 2)
    }

    /// Whether a realm may share one tree across all planes.
    #[must_use]
    pub fn supports_single_tree(self) -> bool {
        matches!(
            self.plane_rtt(),
            Self::PLANE_RTT_SINGLE | Self::PLANE_RTT_AUX_SINGLE
        )
    }

    /// Whether a realm may carry one auxiliary tree per plane.
    #[must_use]
    pub fn supports_aux_trees(self) -> bool {
        matches!(
            self.plane_rtt(),
            Self::PLANE_RTT_AUX | Self::PLANE_RTT_AUX_SINGLE
        )
    }

    /// Whether access-permission indirection is implemented.
    #[must_use]
    pub fn supports_s2ap_indirect(self) -> bool {
        self.0 & Self::S2AP_INDIRECT != 0
    }
}

/// Typed call surface over an injected monitor conduit.
pub struct Rmi<M: Monitor> {
    monitor: M,
}

impl<M: Monitor> Rmi<M> {
    /// Wraps a monitor conduit.
    pub const fn new(monitor: M) -> Self {
        Self { monitor }
    }

    /// Releases the conduit.
    pub fn into_inner(self) -> M {
        self.monitor
    }

    fn call(&mut self, fid: u64, args: &[u64]) -> CallRets {
        debug_assert!(args.len() <= CALL_ARG_WORDS);
        let mut words: CallArgs = [0; CALL_ARG_WORDS];
        words[..args.len()].copy_from_slice(args);
        self.monitor.call(fid, &words)
    }

    fn call0(&mut self, fid: u64, args: &[u64]) -> RmiResult {
        decode_status(self.call(fid, args)[0])
    }

    /// Version handshake; returns the revision the monitor settles on.
    pub fn version(&mut self, requested: u64) -> RmiResult<u64> {
        let rets = self.call(fid::VERSION, &[requested]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Reads one feature register.
    pub fn features(&mut self, index: u64) -> RmiResult<u64> {
        let rets = self.call(fid::FEATURES, &[index]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Transfers one granule from the normal world to the realm world.
    pub fn granule_delegate(&mut self, addr: u64) -> RmiResult {
        self.call0(fid::GRANULE_DELEGATE, &[addr])
    }

    /// Returns one granule to the normal world.
    pub fn granule_undelegate(&mut self, addr: u64) -> RmiResult {
        self.call0(fid::GRANULE_UNDELEGATE, &[addr])
    }

    /// Creates a realm from a populated parameter block.
    pub fn realm_create(&mut self, rd: u64, params_ptr: u64) -> RmiResult {
        self.call0(fid::REALM_CREATE, &[rd, params_ptr])
    }

    /// Transitions a realm from New to Active.
    pub fn realm_activate(&mut self, rd: u64) -> RmiResult {
        self.call0(fid::REALM_ACTIVATE, &[rd])
    }

    /// Destroys an (already emptied) realm.
    pub fn realm_destroy(&mut self, rd: u64) -> RmiResult {
        self.call0(fid::REALM_DESTROY, &[rd])
    }

    /// Number of auxiliary granules each execution context needs.
    pub fn rec_aux_count(&mut self, rd: u64) -> RmiResult<u64> {
        let rets = self.call(fid::REC_AUX_COUNT, &[rd]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Creates one execution context from a populated parameter block.
    pub fn rec_create(&mut self, rd: u64, rec: u64, params_ptr: u64) -> RmiResult {
        self.call0(fid::REC_CREATE, &[rd, rec, params_ptr])
    }

    /// Destroys one execution context.
    pub fn rec_destroy(&mut self, rec: u64) -> RmiResult {
        self.call0(fid::REC_DESTROY, &[rec])
    }

    /// Enters an execution context; returns when the realm exits.
    pub fn rec_enter(&mut self, rec: u64, run_ptr: u64) -> RmiResult {
        self.call0(fid::REC_ENTER, &[rec, run_ptr])
    }

    /// Resolves a PSCI request raised by one context against another.
    pub fn psci_complete(&mut self, calling_rec: u64, target_rec: u64, status: u64) -> RmiResult {
        self.call0(fid::PSCI_COMPLETE, &[calling_rec, target_rec, status])
    }

    /// Creates a data granule at `map_addr`, seeded from `src` unless
    /// `unknown` (zero-fill) is requested.
    pub fn data_create(
        &mut self,
        unknown: bool,
        rd: u64,
        data: u64,
        map_addr: u64,
        src: u64,
    ) -> RmiResult {
        if unknown {
            self.call0(fid::DATA_CREATE_UNKNOWN, &[rd, data, map_addr])
        } else {
            // Final word is the flags argument.
            self.call0(fid::DATA_CREATE, &[rd, data, map_addr, src, 0])
        }
    }

    /// Destroys the data granule at `map_addr`; returns its physical
    /// address and the top of the non-live region.
    pub fn data_destroy(&mut self, rd: u64, map_addr: u64) -> RmiResult<(u64, u64)> {
        let rets = self.call(fid::DATA_DESTROY, &[rd, map_addr]);
        decode_status(rets[0])?;
        Ok((rets[1], rets[2]))
    }

    /// Inserts a delegated granule as a tree node at `level`.
    pub fn rtt_create(&mut self, rd: u64, rtt: u64, map_addr: u64, level: i8) -> RmiResult {
        self.call0(fid::RTT_CREATE, &[rd, rtt, map_addr, level as u64])
    }

    /// Removes a childless tree node; returns its physical address and
    /// the next boundary.
    pub fn rtt_destroy(&mut self, rd: u64, map_addr: u64, level: i8) -> RmiResult<(u64, u64)> {
        let rets = self.call(fid::RTT_DESTROY, &[rd, map_addr, level as u64]);
        decode_status(rets[0])?;
        Ok((rets[1], rets[2]))
    }

    /// Collapses a homogeneous child table into its parent entry;
    /// returns the physical address of the freed node.
    pub fn rtt_fold(&mut self, rd: u64, map_addr: u64, level: i8) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_FOLD, &[rd, map_addr, level as u64]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Non-mutating walk of tree `index` down to at most `level`.
    pub fn rtt_read_entry(
        &mut self,
        rd: u64,
        map_addr: u64,
        level: i8,
        index: u64,
    ) -> RmiResult<RttEntry> {
        let rets = self.call(fid::RTT_READ_ENTRY, &[rd, map_addr, level as u64, index]);
        decode_status(rets[0])?;
        Ok(RttEntry {
            walk_level: rets[1] as i8,
            state: Hipas::from_raw(rets[2]).ok_or(RmiError::Unknown {
                code: 0xFF,
                index: 0,
            })?,
            out_addr: rets[3],
            ripas: Ripas::from_raw(rets[4]).ok_or(RmiError::Unknown {
                code: 0xFF,
                index: 0,
            })?,
        })
    }

    /// Attaches a normal-world output address at `map_addr`.
    pub fn rtt_map_unprotected(
        &mut self,
        rd: u64,
        map_addr: u64,
        level: i8,
        desc: u64,
    ) -> RmiResult {
        self.call0(fid::RTT_MAP_UNPROTECTED, &[rd, map_addr, level as u64, desc])
    }

    /// Detaches an unprotected mapping; returns the next boundary.
    pub fn rtt_unmap_unprotected(&mut self, rd: u64, map_addr: u64, level: i8) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_UNMAP_UNPROTECTED, &[rd, map_addr, level as u64]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Sets the content class of `[start, end)` to RAM before activation;
    /// returns the address the walk progressed to.
    pub fn rtt_init_ripas(&mut self, rd: u64, start: u64, end: u64) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_INIT_RIPAS, &[rd, start, end]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Applies the content-state change a context requested on exit;
    /// returns the address the walk progressed to.
    pub fn rtt_set_ripas(&mut self, rd: u64, rec: u64, start: u64, end: u64) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_SET_RIPAS, &[rd, rec, start, end]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Applies the access-permission change a context requested on exit.
    pub fn rtt_set_s2ap(&mut self, rd: u64, rec: u64, start: u64, end: u64) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_SET_S2AP, &[rd, rec, start, end]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Inserts a node into auxiliary tree `index`.
    pub fn rtt_aux_create(
        &mut self,
        rd: u64,
        rtt: u64,
        map_addr: u64,
        level: i8,
        index: u64,
    ) -> RmiResult {
        self.call0(fid::RTT_AUX_CREATE, &[rd, rtt, map_addr, level as u64, index])
    }

    /// Removes a childless node from auxiliary tree `index`.
    pub fn rtt_aux_destroy(
        &mut self,
        rd: u64,
        map_addr: u64,
        level: i8,
        index: u64,
    ) -> RmiResult<(u64, u64)> {
        let rets = self.call(fid::RTT_AUX_DESTROY, &[rd, map_addr, level as u64, index]);
        decode_status(rets[0])?;
        Ok((rets[1], rets[2]))
    }

    /// Collapses a homogeneous child table in auxiliary tree `index`.
    pub fn rtt_aux_fold(&mut self, rd: u64, map_addr: u64, level: i8, index: u64) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_AUX_FOLD, &[rd, map_addr, level as u64, index]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Mirrors an assigned protected page into auxiliary tree `index`.
    pub fn rtt_aux_map_protected(&mut self, rd: u64, map_addr: u64, index: u64) -> RmiResult {
        self.call0(fid::RTT_AUX_MAP_PROTECTED, &[rd, map_addr, index])
    }

    /// Removes a protected mapping from auxiliary tree `index`.
    pub fn rtt_aux_unmap_protected(&mut self, rd: u64, map_addr: u64, index: u64) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_AUX_UNMAP_PROTECTED, &[rd, map_addr, index]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }

    /// Attaches an unprotected output address in auxiliary tree `index`.
    pub fn rtt_aux_map_unprotected(
        &mut self,
        rd: u64,
        map_addr: u64,
        desc: u64,
        index: u64,
    ) -> RmiResult {
        self.call0(fid::RTT_AUX_MAP_UNPROTECTED, &[rd, map_addr, desc, index])
    }

    /// Removes an unprotected mapping from auxiliary tree `index`.
    pub fn rtt_aux_unmap_unprotected(
        &mut self,
        rd: u64,
        map_addr: u64,
        index: u64,
    ) -> RmiResult<u64> {
        let rets = self.call(fid::RTT_AUX_UNMAP_UNPROTECTED, &[rd, map_addr, index]);
        decode_status(rets[0])?;
        Ok(rets[1])
    }
}
