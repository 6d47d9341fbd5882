// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Realm lifecycle: creation, population, activation, destruction.
//!
//! A [`Realm`] owns every granule handed to the monitor on its behalf
//! and knows how to take all of them back. Construction is all-or-
//! nothing: any failure unwinds the granules delegated so far, so a
//! failed create leaves the delegation balance untouched.

use alloc::vec::Vec;

use crate::addr::{align_up, is_aligned, rtt_map_size, GRANULE_SIZE, RTT_STRIDE};
use crate::error::{Error, Result};
use crate::granule::{self, GranuleTracker, Unwind};
use crate::pool::{write_u64, PagePool};
use crate::region;
use crate::rmi::{abi_version, FeatureReg0, Rmi, ABI_VERSION_MAJOR, ABI_VERSION_MINOR};
use crate::rtt::PRIMARY_TREE;
use crate::smc::Monitor;

pub mod params;

#[cfg(test)]
mod realm_test;

/// Highest number of auxiliary planes the parameter block can carry.
pub const MAX_AUX_PLANES: usize = 3;

/// Lifecycle state of a realm, as tracked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmState {
    /// Not created, or already destroyed.
    Null,
    /// Created; measurable content may still be added.
    New,
    /// Running; content is sealed.
    Active,
    /// The realm requested system shutdown.
    SystemOff,
}

/// Measurement hash selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha512,
}

/// Policy for content-state change requests the realm raises at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RipasReply {
    /// Apply every requested change.
    #[default]
    Accept,
    /// Reject the next request, then accept (exercises the realm's
    /// rejection handling exactly once).
    RejectFirst,
}

/// Per-context creation settings.
#[derive(Debug, Clone, Copy)]
pub struct RecConfig {
    /// Whether the context may be entered without a wake-up call.
    pub runnable: bool,
    /// Initial program counter.
    pub pc: u64,
    /// Initial values of the first eight general registers.
    pub gprs: [u64; 8],
}

impl RecConfig {
    #[must_use]
    pub const fn runnable(pc: u64) -> Self {
        Self {
            runnable: true,
            pc,
            gprs: [0; 8],
        }
    }
}

/// Everything a caller decides about a realm before creation.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    /// Protected address-range size in bytes (granule multiple).
    pub par_size: u64,
    /// Contexts to create, primary plane only.
    pub recs: Vec<RecConfig>,
    /// Auxiliary planes (0 to [`MAX_AUX_PLANES`]).
    pub num_aux_planes: u8,
    /// One tree per plane instead of a single shared tree.
    pub rtt_tree_per_plane: bool,
    /// Permission indirection; requires per-plane trees.
    pub s2ap_indirection: bool,
    /// Starting tree level.
    pub rtt_start_level: i8,
    /// Intended address width in bits; clamped to what the monitor
    /// supports when absent.
    pub s2sz: Option<u32>,
    /// Requested SVE vector length; silently downgraded or dropped when
    /// the monitor offers less.
    pub sve_vl: Option<u8>,
    /// Requested PMU counter count, downgraded likewise.
    pub pmu_num_ctrs: Option<u8>,
    pub hash: HashAlgo,
    pub ripas_reply: RipasReply,
    /// Realm personalization value.
    pub rpv: [u8; params::RPV_SIZE],
}

impl RealmConfig {
    /// A single-context realm with `par_size` bytes of protected memory
    /// and entry point `pc`.
    #[must_use]
    pub fn basic(par_size: u64, pc: u64) -> Self {
        Self {
            par_size,
            recs: alloc::vec![RecConfig::runnable(pc)],
            num_aux_planes: 0,
            rtt_tree_per_plane: false,
            s2ap_indirection: false,
            rtt_start_level: 0,
            s2sz: None,
            sve_vl: None,
            pmu_num_ctrs: None,
            hash: HashAlgo::Sha256,
            ripas_reply: RipasReply::Accept,
            rpv: [0; params::RPV_SIZE],
        }
    }
}

/// One created execution context.
#[derive(Debug)]
pub struct Rec {
    /// The delegated context granule.
    pub granule: u64,
    /// The (undelegated) run page shared with the monitor on entry.
    pub run_page: u64,
    /// Affinity value the context was created with.
    pub mpidr: u64,
    pub runnable: bool,
    /// Base of the delegated auxiliary granules.
    pub aux_base: u64,
    pub aux_count: usize,
}

/// Identifier allocator shared between realms.
#[derive(Debug, Default)]
pub struct VmidAllocator {
    inner: spin::Mutex<VmidInner>,
}

#[derive(Debug, Default)]
struct VmidInner {
    next: u16,
    free: Vec<u16>,
}

impl VmidAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(VmidInner {
                next: 1,
                free: Vec::new(),
            }),
        }
    }

    fn alloc(&self) -> u16 {
        let mut inner = self.inner.lock();
        inner.free.pop().unwrap_or_else(|| {
            let id = inner.next;
            inner.next += 1;
            id
        })
    }

    fn free(&self, id: u16) {
        self.inner.lock().free.push(id);
    }
}

/// A live realm and every host resource backing it.
#[derive(Debug)]
pub struct Realm {
    pub state: RealmState,
    /// The realm descriptor granule.
    pub rd: u64,
    /// Base of the primary tree's starting-level tables.
    pub rtt_base: u64,
    /// Number of contiguous starting-level tables per tree.
    pub rtt_num_start: u64,
    pub rtt_start_level: i8,
    /// Starting-level table base per auxiliary tree.
    pub aux_rtt_base: Vec<u64>,
    pub vmid: u16,
    pub aux_vmids: Vec<u16>,
    pub features0: FeatureReg0,
    /// Address width in bits. The top address bit selects the
    /// unprotected alias space.
    pub s2sz: u32,
    pub num_aux_planes: u8,
    pub rtt_tree_per_plane: bool,
    pub s2ap_indirection: bool,
    pub ripas_reply: RipasReply,
    /// Protected address range; addresses equal physical addresses.
    pub par_base: u64,
    pub par_size: u64,
    /// Normal-world page shared with the realm at its unprotected alias.
    pub shared_page: u64,
    pub rec_aux_count: u64,
    pub recs: Vec<Rec>,
}

impl Realm {
    /// Address bit that selects the unprotected alias half.
    #[must_use]
    pub fn ns_flag(&self) -> u64 {
        1 << (self.s2sz - 1)
    }

    /// First address above the protected space.
    #[must_use]
    pub fn protected_top(&self) -> u64 {
        self.ns_flag()
    }

    /// Address of the shared page as the realm sees it.
    #[must_use]
    pub fn shared_page_realm_view(&self) -> u64 {
        self.shared_page | self.ns_flag()
    }

    /// Trees that exist for this realm: the primary one plus one per
    /// auxiliary plane when the planes do not share it.
    #[must_use]
    pub fn tree_indices(&self) -> impl Iterator<Item = u64> + '_ {
        let aux = if self.rtt_tree_per_plane {
            u64::from(self.num_aux_planes)
        } else {
            0
        };
        core::iter::once(PRIMARY_TREE).chain(1..=aux)
    }

    /// Looks up a context by its affinity value.
    #[must_use]
    pub fn rec_index_by_mpidr(&self, mpidr: u64) -> Option<usize> {
        self.recs.iter().position(|r| r.mpidr == mpidr)
    }
}

/// Packs a linear context index into an affinity value.
#[must_use]
pub const fn rec_mpidr(idx: usize) -> u64 {
    let idx = idx as u64;
    (idx & 0xF)
        | (((idx >> 4) & 0xFF) << 8)
        | (((idx >> 12) & 0xFF) << 16)
        | (((idx >> 20) & 0xFF) << 32)
}

/// Number of contiguous starting-level tables one tree needs to cover
/// the whole address space.
#[must_use]
pub(crate) fn num_start_tables(s2sz: u32, start_level: i8) -> u64 {
    // One starting-level table resolves RTT_STRIDE bits on top of the
    // range one of its entries covers.
    let covered_bits = rtt_map_size(start_level).trailing_zeros() + RTT_STRIDE;
    if s2sz > covered_bits {
        1 << (s2sz - covered_bits)
    } else {
        1
    }
}

fn validate(config: &RealmConfig, features: FeatureReg0) -> Result<u32> {
    if config.par_size == 0 || !is_aligned(config.par_size, GRANULE_SIZE) {
        return Err(Error::Config("protected range size must be whole granules"));
    }
    if config.recs.is_empty() {
        return Err(Error::Config("a realm needs at least one execution context"));
    }
    if usize::from(config.num_aux_planes) > MAX_AUX_PLANES {
        return Err(Error::Config("too many auxiliary planes"));
    }
    if config.num_aux_planes > features.max_aux_planes() {
        return Err(Error::Config("monitor supports fewer auxiliary planes"));
    }
    if config.num_aux_planes > 0 {
        if config.rtt_tree_per_plane && !features.supports_aux_trees() {
            return Err(Error::Config("monitor cannot give each plane its own tree"));
        }
        if !config.rtt_tree_per_plane && !features.supports_single_tree() {
            return Err(Error::Config("monitor cannot share one tree across planes"));
        }
    }
    if config.s2ap_indirection {
        // Indirection redefines permission encodings per plane, which
        // only works when the planes do not share tree entries.
        if !config.rtt_tree_per_plane {
            return Err(Error::Config(
                "permission indirection requires per-plane trees",
            ));
        }
        if !features.supports_s2ap_indirect() {
            return Err(Error::Config("monitor lacks permission indirection"));
        }
    }
    if !(0..=2).contains(&config.rtt_start_level) {
        return Err(Error::Config("unsupported starting tree level"));
    }
    let s2sz = config.s2sz.unwrap_or_else(|| features.s2sz());
    if s2sz > features.s2sz() || s2sz < 20 {
        return Err(Error::Config("address width out of range"));
    }
    // The protected half must hold the whole protected range.
    if config.par_size >= 1 << (s2sz - 1) {
        return Err(Error::Config("protected range exceeds the address space"));
    }
    Ok(s2sz)
}

impl Realm {
    /// Performs the version handshake, probes features, validates the
    /// configuration, creates the realm and all its execution contexts.
    ///
    /// The realm is left in the New state, with no memory populated.
    pub fn create<M: Monitor, P: PagePool>(
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        vmids: &VmidAllocator,
        config: &RealmConfig,
    ) -> Result<Self> {
        let settled = rmi.version(abi_version(ABI_VERSION_MAJOR, ABI_VERSION_MINOR))?;
        if settled >> 16 != ABI_VERSION_MAJOR {
            return Err(Error::Config("monitor speaks an incompatible revision"));
        }
        let features = FeatureReg0(rmi.features(0)?);
        let s2sz = validate(config, features)?;

        // Feature downgrades are silent: the realm measurement covers
        // what was granted, so the caller can still detect a mismatch.
        let sve_vl = config.sve_vl.map(|vl| vl.min(features.sve_vl()));
        let use_sve = sve_vl.is_some() && features.0 & FeatureReg0::SVE_EN != 0;
        let pmu_ctrs = config.pmu_num_ctrs.map(|n| n.min(features.pmu_num_ctrs()));
        let use_pmu = pmu_ctrs.is_some() && features.0 & FeatureReg0::PMU_EN != 0;

        let num_start = num_start_tables(s2sz, config.rtt_start_level);
        let num_trees = if config.rtt_tree_per_plane {
            1 + u64::from(config.num_aux_planes)
        } else {
            1
        };

        let mut unwind = Unwind::new();
        let created = Self::create_inner(
            rmi,
            pool,
            tracker,
            vmids,
            config,
            features,
            s2sz,
            (use_sve, sve_vl, use_pmu, pmu_ctrs),
            num_start,
            num_trees,
            &mut unwind,
        );
        match created {
            Ok(realm) => Ok(realm),
            Err(e) => {
                unwind.abort(rmi, pool, tracker);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_inner<M: Monitor, P: PagePool>(
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        vmids: &VmidAllocator,
        config: &RealmConfig,
        features: FeatureReg0,
        s2sz: u32,
        granted: (bool, Option<u8>, bool, Option<u8>),
        num_start: u64,
        num_trees: u64,
        unwind: &mut Unwind,
    ) -> Result<Self> {
        let (use_sve, sve_vl, use_pmu, pmu_ctrs) = granted;

        let rd = granule::alloc_delegated(rmi, pool, tracker, 1)?;
        unwind.push_delegated(rd);
        unwind.push_pages(rd, 1);

        let mut tree_bases = Vec::with_capacity(num_trees as usize);
        for _ in 0..num_trees {
            let base = granule::alloc_delegated(rmi, pool, tracker, num_start as usize)?;
            for i in 0..num_start {
                unwind.push_delegated(base + i * GRANULE_SIZE);
            }
            unwind.push_pages(base, num_start as usize);
            tree_bases.push(base);
        }
        let rtt_base = tree_bases[0];
        let aux_rtt_base: Vec<u64> = tree_bases[1..].to_vec();

        let vmid = vmids.alloc();
        let aux_vmids: Vec<u16> = (0..config.num_aux_planes).map(|_| vmids.alloc()).collect();
        let free_vmids = |vmids_alloc: &VmidAllocator| {
            vmids_alloc.free(vmid);
            for &v in &aux_vmids {
                vmids_alloc.free(v);
            }
        };

        let params_page = match pool.alloc_pages(1) {
            Some(p) => p,
            None => {
                free_vmids(vmids);
                return Err(Error::OutOfMemory);
            }
        };

        let mut flags0 = params::RealmFlags0::empty();
        if features.0 & FeatureReg0::LPA2 != 0 {
            flags0 |= params::RealmFlags0::LPA2;
        }
        if use_sve {
            flags0 |= params::RealmFlags0::SVE;
        }
        if use_pmu {
            flags0 |= params::RealmFlags0::PMU;
        }
        let mut flags1 = params::RealmFlags1::empty();
        if config.rtt_tree_per_plane {
            flags1 |= params::RealmFlags1::RTT_TREE_PER_PLANE;
        }
        if config.s2ap_indirection {
            flags1 |= params::RealmFlags1::S2AP_INDIRECT;
        }

        write_u64(pool, params_page + params::FLAGS0, flags0.bits());
        write_u64(pool, params_page + params::S2SZ, u64::from(s2sz));
        write_u64(
            pool,
            params_page + params::SVE_VL,
            u64::from(sve_vl.unwrap_or(0)),
        );
        write_u64(pool, params_page + params::NUM_BPS, u64::from(features.num_bps()));
        write_u64(pool, params_page + params::NUM_WPS, u64::from(features.num_wps()));
        write_u64(
            pool,
            params_page + params::PMU_NUM_CTRS,
            u64::from(pmu_ctrs.unwrap_or(0)),
        );
        let hash = match config.hash {
            HashAlgo::Sha256 => params::HASH_SHA_256,
            HashAlgo::Sha512 => params::HASH_SHA_512,
        };
        write_u64(pool, params_page + params::HASH_ALGO, hash);
        write_u64(pool, params_page + params::FLAGS1, flags1.bits());
        write_u64(
            pool,
            params_page + params::NUM_AUX_PLANES,
            u64::from(config.num_aux_planes),
        );
        pool.write(params_page + params::RPV, &config.rpv);
        write_u64(pool, params_page + params::VMID, u64::from(vmid));
        write_u64(pool, params_page + params::RTT_BASE, rtt_base);
        write_u64(
            pool,
            params_page + params::RTT_LEVEL_START,
            config.rtt_start_level as u64,
        );
        write_u64(pool, params_page + params::RTT_NUM_START, num_start);
        for (i, &v) in aux_vmids.iter().enumerate() {
            write_u64(
                pool,
                params_page + params::AUX_VMID + 8 * i as u64,
                u64::from(v),
            );
        }
        for (i, &base) in aux_rtt_base.iter().enumerate() {
            write_u64(
                pool,
                params_page + params::AUX_RTT_BASE + 8 * i as u64,
                base,
            );
        }

        let created = rmi.realm_create(rd, params_page);
        pool.free_pages(params_page, 1);
        if let Err(e) = created {
            free_vmids(vmids);
            return Err(e.into());
        }

        // From here the descriptor is live; a failure must destroy it
        // again on top of the granule unwind.
        let finished = Self::finish_create(
            rmi,
            pool,
            tracker,
            config,
            features,
            s2sz,
            rd,
            rtt_base,
            num_start,
            aux_rtt_base.clone(),
            vmid,
            aux_vmids.clone(),
            unwind,
        );
        match finished {
            Ok(realm) => Ok(realm),
            Err(e) => {
                if rmi.realm_destroy(rd).is_err() {
                    log::warn!("descriptor {rd:#x} survived a failed create");
                }
                free_vmids(vmids);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_create<M: Monitor, P: PagePool>(
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        config: &RealmConfig,
        features: FeatureReg0,
        s2sz: u32,
        rd: u64,
        rtt_base: u64,
        num_start: u64,
        aux_rtt_base: Vec<u64>,
        vmid: u16,
        aux_vmids: Vec<u16>,
        unwind: &mut Unwind,
    ) -> Result<Self> {
        let rec_aux_count = rmi.rec_aux_count(rd)?;

        let par_pages = (config.par_size / GRANULE_SIZE) as usize;
        let par_base = pool.alloc_pages(par_pages).ok_or(Error::OutOfMemory)?;
        unwind.push_pages(par_base, par_pages);

        let shared_page = pool.alloc_pages(1).ok_or(Error::OutOfMemory)?;
        unwind.push_pages(shared_page, 1);

        let mut realm = Self {
            state: RealmState::New,
            rd,
            rtt_base,
            rtt_num_start: num_start,
            rtt_start_level: config.rtt_start_level,
            aux_rtt_base,
            vmid,
            aux_vmids,
            features0: features,
            s2sz,
            num_aux_planes: config.num_aux_planes,
            rtt_tree_per_plane: config.rtt_tree_per_plane,
            s2ap_indirection: config.s2ap_indirection,
            ripas_reply: config.ripas_reply,
            par_base,
            par_size: config.par_size,
            shared_page,
            rec_aux_count,
            recs: Vec::new(),
        };

        for (idx, rec_config) in config.recs.iter().enumerate() {
            match create_rec(rmi, pool, tracker, &realm, idx, rec_config, unwind) {
                Ok(rec) => realm.recs.push(rec),
                Err(e) => {
                    // Contexts created so far must be destroyed before
                    // the granule unwind can undelegate their pages.
                    for rec in realm.recs.drain(..).rev() {
                        if rmi.rec_destroy(rec.granule).is_err() {
                            log::warn!("context {:#x} survived a failed create", rec.granule);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(realm)
    }

    /// Seals the realm's initial content and allows context entry.
    pub fn activate<M: Monitor>(&mut self, rmi: &mut Rmi<M>) -> Result<()> {
        if self.state != RealmState::New {
            return Err(Error::State(self.state));
        }
        rmi.realm_activate(self.rd)?;
        self.state = RealmState::Active;
        Ok(())
    }

    /// Copies `payload` into the protected range at `offset` and maps it
    /// as measured data. Only legal before activation.
    pub fn map_payload<M: Monitor, P: PagePool>(
        &mut self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        offset: u64,
        payload: &[u8],
    ) -> Result<()> {
        if self.state != RealmState::New {
            return Err(Error::State(self.state));
        }
        let size = align_up(payload.len() as u64, GRANULE_SIZE);
        if offset + size > self.par_size {
            return Err(Error::Config("payload does not fit the protected range"));
        }
        // Stage through normal-world pages; the source of a data-create
        // call must still be host-owned.
        let staging = pool.alloc_pages((size / GRANULE_SIZE) as usize).ok_or(Error::OutOfMemory)?;
        pool.write(staging, payload);
        let result = region::map_protected_data(
            rmi,
            pool,
            tracker,
            self.rd,
            self.par_base + offset,
            size,
            Some(staging),
        );
        pool.free_pages(staging, (size / GRANULE_SIZE) as usize);
        result
    }

    /// Attaches zero-filled protected data over `[offset, offset + size)`.
    /// Only legal before activation.
    pub fn map_unknown<M: Monitor, P: PagePool>(
        &mut self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.state != RealmState::New {
            return Err(Error::State(self.state));
        }
        if offset + size > self.par_size {
            return Err(Error::Config("range does not fit the protected range"));
        }
        region::map_protected_data(
            rmi,
            pool,
            tracker,
            self.rd,
            self.par_base + offset,
            size,
            None,
        )
    }

    /// Declares `[offset, offset + size)` of the protected range as RAM.
    /// Only legal before activation.
    pub fn init_ripas<M: Monitor, P: PagePool>(
        &mut self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.state != RealmState::New {
            return Err(Error::State(self.state));
        }
        region::init_ripas(
            rmi,
            pool,
            tracker,
            self.rd,
            self.par_base + offset,
            size,
        )
    }

    /// Maps the shared page at its unprotected alias in every tree, so
    /// all planes can reach it.
    pub fn map_shared_page<M: Monitor, P: PagePool>(
        &mut self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
    ) -> Result<()> {
        let (shared, flag) = (self.shared_page, self.ns_flag());
        for tree in self.tree_indices().collect::<Vec<_>>() {
            region::map_unprotected(
                rmi, pool, tracker, self.rd, shared, GRANULE_SIZE, flag, tree,
            )?;
        }
        Ok(())
    }

    /// Tears the realm down completely: contexts, trees, data, the
    /// descriptor, and every delegated granule. Idempotent once Null.
    pub fn destroy<M: Monitor, P: PagePool>(
        &mut self,
        rmi: &mut Rmi<M>,
        pool: &mut P,
        tracker: &mut GranuleTracker,
        vmids: &VmidAllocator,
    ) -> Result<()> {
        if self.state == RealmState::Null {
            return Ok(());
        }

        for rec in self.recs.drain(..) {
            rmi.rec_destroy(rec.granule)?;
            granule::release(rmi, pool, tracker, rec.granule)?;
            for i in 0..rec.aux_count {
                granule::undelegate(rmi, tracker, rec.aux_base + i as u64 * GRANULE_SIZE)?;
            }
            if rec.aux_count > 0 {
                pool.free_pages(rec.aux_base, rec.aux_count);
            }
            pool.free_pages(rec.run_page, 1);
        }

        // Auxiliary trees first: they hold no data granules, only
        // mirrored mappings that must be gone before the primary tree
        // releases the data itself.
        let space = 1u64 << self.s2sz;
        let aux_trees: Vec<u64> = self.tree_indices().skip(1).collect();
        for tree in aux_trees {
            region::tear_down_tree(
                rmi,
                pool,
                tracker,
                self.rd,
                tree,
                self.rtt_start_level,
                0,
                space,
                self.protected_top(),
            )?;
        }
        region::tear_down_tree(
            rmi,
            pool,
            tracker,
            self.rd,
            PRIMARY_TREE,
            self.rtt_start_level,
            0,
            space,
            self.protected_top(),
        )?;

        rmi.realm_destroy(self.rd)?;
        granule::release(rmi, pool, tracker, self.rd)?;

        let num_start = self.rtt_num_start as usize;
        let mut roots = alloc::vec![self.rtt_base];
        roots.extend_from_slice(&self.aux_rtt_base);
        for base in roots {
            for i in 0..num_start {
                granule::undelegate(rmi, tracker, base + i as u64 * GRANULE_SIZE)?;
            }
            pool.free_pages(base, num_start);
        }

        pool.free_pages(self.par_base, (self.par_size / GRANULE_SIZE) as usize);
        pool.free_pages(self.shared_page, 1);

        vmids.free(self.vmid);
        for &v in &self.aux_vmids {
            vmids.free(v);
        }
        self.aux_vmids.clear();

        self.state = RealmState::Null;
        Ok(())
    }
}

/// Builds one execution context: run page, context granule, auxiliary
/// granules, parameter block. Every allocation is recorded on `unwind`.
fn create_rec<M: Monitor, P: PagePool>(
    rmi: &mut Rmi<M>,
    pool: &mut P,
    tracker: &mut GranuleTracker,
    realm: &Realm,
    idx: usize,
    config: &RecConfig,
    unwind: &mut Unwind,
) -> Result<Rec> {
    let run_page = pool.alloc_pages(1).ok_or(Error::OutOfMemory)?;
    unwind.push_pages(run_page, 1);

    let rec_page = granule::alloc_delegated(rmi, pool, tracker, 1)?;
    unwind.push_delegated(rec_page);
    unwind.push_pages(rec_page, 1);

    let aux_count = realm.rec_aux_count as usize;
    let aux_base = if aux_count > 0 {
        let base = granule::alloc_delegated(rmi, pool, tracker, aux_count)?;
        for i in 0..aux_count {
            unwind.push_delegated(base + i as u64 * GRANULE_SIZE);
        }
        unwind.push_pages(base, aux_count);
        base
    } else {
        0
    };

    let params_page = pool.alloc_pages(1).ok_or(Error::OutOfMemory)?;
    let mpidr = rec_mpidr(idx);
    crate::rec::run::write_rec_params(pool, params_page, config, mpidr, aux_base, aux_count);
    let created = rmi.rec_create(realm.rd, rec_page, params_page);
    pool.free_pages(params_page, 1);
    created?;

    Ok(Rec {
        granule: rec_page,
        run_page,
        mpidr,
        runnable: config.runnable,
        aux_base,
        aux_count,
    })
}
