// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The monitor model behind [`MockRmm`].
//!
//! The model enforces granule ownership states, tree shape, the
//! content-state transition rules and the entry/exit handshake, so the
//! engine is tested against the same refusals a real monitor would
//! produce. Realm execution is scripted: each context carries a queue
//! of exits it will produce, and entry fails when the host did not
//! service the previous exit.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;

use super::{Arena, SharedArena};
use crate::addr::{align_down, align_up, is_aligned, rtt_map_size, GRANULE_SIZE, RTT_PAGE_LEVEL};
use crate::realm::params;
use crate::rec::run;
use crate::rmi::{abi_version, encode_status, fid, FeatureReg0, RmiError, RmiResult};
use crate::smc::{CallArgs, CallRets, Monitor, CALL_RET_WORDS};

/// Ownership state of a granule the monitor knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GranuleState {
    Delegated,
    Rd,
    RttNode,
    Rec,
    RecAux,
    Data,
}

/// One translation tree: explicit nodes below the (implicit) root,
/// keyed by level and the base of the range their parent entry covers.
#[derive(Debug, Default)]
struct TreeModel {
    nodes: BTreeMap<(i8, u64), u64>,
    /// Unprotected mappings, page granular.
    ns: BTreeMap<u64, u64>,
    /// Protected pages mirrored from the primary tree (aux trees only).
    mirrored: BTreeSet<u64>,
    /// Block entries left behind by folding a fully-assigned table,
    /// keyed by entry level and base.
    blocks: BTreeSet<(i8, u64)>,
}

impl TreeModel {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.ns.is_empty()
            && self.mirrored.is_empty()
            && self.blocks.is_empty()
    }
}

/// Content-state wire values.
mod ripas {
    pub const EMPTY: u64 = 0;
    pub const RAM: u64 = 1;
    pub const DESTROYED: u64 = 2;
}

/// Host-side ownership wire values.
mod hipas {
    pub const UNASSIGNED: u64 = 0;
    pub const ASSIGNED: u64 = 1;
    pub const TABLE: u64 = 2;
}

/// An exit a scripted context will produce on its next entry.
#[derive(Debug, Clone)]
pub enum ScriptedExit {
    /// Host call with the given sub-command and argument registers.
    HostCall { imm: u64, gprs: [u64; 8] },
    /// Content-state change request over `[base, base + size)`.
    RipasChange { base: u64, size: u64, value: u64 },
    /// Permission change request over `[base, top)` from `plane`.
    S2apChange { base: u64, top: u64, plane: u64 },
    /// Stage-2 translation fault at `ipa` raised by auxiliary `plane`.
    PlaneFault { ipa: u64, plane: u64 },
    /// Interrupt pending in the normal world.
    Interrupt,
    /// Power request with the given function and target affinity.
    Power { psci_fid: u64, target_mpidr: u64 },
}

#[derive(Debug)]
struct RecModel {
    mpidr: u64,
    runnable: bool,
    aux: Vec<u64>,
    script: VecDeque<ScriptedExit>,
    pending_ripas: Option<(u64, u64, u64)>,
    pending_s2ap: Option<(u64, u64, u64)>,
    pending_fault: Option<(u64, u64)>,
    pending_psci: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RealmPhase {
    New,
    Active,
}

#[derive(Debug)]
struct RealmModel {
    phase: RealmPhase,
    s2sz: u32,
    start_level: i8,
    num_start: u64,
    rtt_base: u64,
    aux_rtt: Vec<u64>,
    tree_per_plane: bool,
    trees: Vec<TreeModel>,
    /// Protected data pages: address to backing granule.
    data: BTreeMap<u64, u64>,
    /// Content state per protected page; absent means empty.
    ripas: BTreeMap<u64, u64>,
    recs: BTreeMap<u64, RecModel>,
}

impl RealmModel {
    fn protected_top(&self) -> u64 {
        1 << (self.s2sz - 1)
    }

    fn walk(&self, tree: usize, addr: u64, target: i8) -> Result<(), i8> {
        let mut level = self.start_level;
        while level < target {
            let next = level + 1;
            let key = (next, align_down(addr, rtt_map_size(next - 1)));
            if !self.trees[tree].nodes.contains_key(&key) {
                return Err(level);
            }
            level = next;
        }
        Ok(())
    }
}

/// Scriptable in-process monitor.
#[derive(Debug)]
pub struct MockRmm {
    arena: SharedArena,
    features0: u64,
    rec_aux_count: u64,
    granules: BTreeMap<u64, GranuleState>,
    realms: BTreeMap<u64, RealmModel>,
    fail_next: Option<(u64, RmiError)>,
}

/// Capabilities the default model advertises: 39-bit addresses, SVE,
/// PMU, both hashes, three auxiliary planes with per-plane trees or a
/// shared one, and permission indirection.
fn default_features0() -> u64 {
    39 | FeatureReg0::SVE_EN
        | (3 << 10)
        | (2 << 14)
        | (2 << 18)
        | FeatureReg0::PMU_EN
        | (4 << 23)
        | FeatureReg0::HASH_SHA_256
        | FeatureReg0::HASH_SHA_512
        | (3 << 30)
        | (FeatureReg0::PLANE_RTT_AUX_SINGLE << 34)
        | FeatureReg0::S2AP_INDIRECT
}

impl MockRmm {
    #[must_use]
    pub fn new(arena: SharedArena) -> Self {
        Self {
            arena,
            features0: default_features0(),
            rec_aux_count: 2,
            granules: BTreeMap::new(),
            realms: BTreeMap::new(),
            fail_next: None,
        }
    }

    /// Overrides the advertised capability word.
    pub fn set_features0(&mut self, features0: u64) {
        self.features0 = features0;
    }

    /// Makes the next call with identifier `fid` fail with `error`.
    pub fn fail_next(&mut self, fid: u64, error: RmiError) {
        self.fail_next = Some((fid, error));
    }

    /// Queues an exit the context at `rec` will produce.
    pub fn push_script(&mut self, rec: u64, exit: ScriptedExit) {
        for realm in self.realms.values_mut() {
            if let Some(model) = realm.recs.get_mut(&rec) {
                model.script.push_back(exit);
                return;
            }
        }
        panic!("no such context: {rec:#x}");
    }

    /// Granules currently delegated or in realm use, for balance checks.
    #[must_use]
    pub fn owned_granules(&self) -> usize {
        self.granules.len()
    }

    fn granule(&self, addr: u64) -> Option<GranuleState> {
        self.granules.get(&addr).copied()
    }

    fn take_delegated(&mut self, addr: u64, into: GranuleState) -> RmiResult {
        match self.granule(addr) {
            Some(GranuleState::Delegated) => {
                self.granules.insert(addr, into);
                Ok(())
            }
            _ => Err(RmiError::Input),
        }
    }

    fn release_to_delegated(&mut self, addr: u64) {
        self.granules.insert(addr, GranuleState::Delegated);
    }

    fn realm(&mut self, rd: u64) -> RmiResult<&mut RealmModel> {
        if self.granule(rd) != Some(GranuleState::Rd) {
            return Err(RmiError::Input);
        }
        self.realms.get_mut(&rd).ok_or(RmiError::Input)
    }

    fn realm_of_rec(&mut self, rec: u64) -> RmiResult<&mut RealmModel> {
        self.realms
            .values_mut()
            .find(|r| r.recs.contains_key(&rec))
            .ok_or(RmiError::Input)
    }

    fn delegate(&mut self, addr: u64) -> RmiResult {
        if !is_aligned(addr, GRANULE_SIZE) || !self.arena.borrow().contains(addr, GRANULE_SIZE) {
            return Err(RmiError::Input);
        }
        if self.granules.contains_key(&addr) {
            return Err(RmiError::Input);
        }
        self.granules.insert(addr, GranuleState::Delegated);
        Ok(())
    }

    fn undelegate(&mut self, addr: u64) -> RmiResult {
        match self.granule(addr) {
            Some(GranuleState::Delegated) => {
                self.granules.remove(&addr);
                // Contents must not leak back to the normal world.
                self.arena.borrow_mut().zero_pages(addr, 1);
                Ok(())
            }
            _ => Err(RmiError::Input),
        }
    }

    fn realm_create(&mut self, rd: u64, params_ptr: u64) -> RmiResult {
        if self.granule(rd) != Some(GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        let (s2sz, flags1, num_aux, rtt_base, start_level, num_start, aux_rtt) = {
            let arena = self.arena.borrow();
            let s2sz = arena.read_u64(params_ptr + params::S2SZ) as u32;
            let flags1 = arena.read_u64(params_ptr + params::FLAGS1);
            let num_aux = arena.read_u64(params_ptr + params::NUM_AUX_PLANES);
            let rtt_base = arena.read_u64(params_ptr + params::RTT_BASE);
            let start_level = arena.read_u64(params_ptr + params::RTT_LEVEL_START) as i8;
            let num_start = arena.read_u64(params_ptr + params::RTT_NUM_START);
            let mut aux_rtt = Vec::new();
            let tree_per_plane = flags1 & params::RealmFlags1::RTT_TREE_PER_PLANE.bits() != 0;
            if tree_per_plane {
                for i in 0..num_aux {
                    aux_rtt.push(arena.read_u64(params_ptr + params::AUX_RTT_BASE + 8 * i));
                }
            }
            (s2sz, flags1, num_aux, rtt_base, start_level, num_start, aux_rtt)
        };
        if s2sz == 0 || s2sz > FeatureReg0(self.features0).s2sz() || num_aux > 3 {
            return Err(RmiError::Input);
        }
        let tree_per_plane = flags1 & params::RealmFlags1::RTT_TREE_PER_PLANE.bits() != 0;

        // Every starting-level table of every tree must be delegated.
        let mut roots = alloc::vec![rtt_base];
        roots.extend_from_slice(&aux_rtt);
        for &base in &roots {
            for i in 0..num_start {
                if self.granule(base + i * GRANULE_SIZE) != Some(GranuleState::Delegated) {
                    return Err(RmiError::Input);
                }
            }
        }
        for &base in &roots {
            for i in 0..num_start {
                self.granules.insert(base + i * GRANULE_SIZE, GranuleState::RttNode);
            }
        }
        self.granules.insert(rd, GranuleState::Rd);

        let num_trees = 1 + aux_rtt.len();
        let mut trees = Vec::with_capacity(num_trees);
        trees.resize_with(num_trees, TreeModel::default);
        self.realms.insert(
            rd,
            RealmModel {
                phase: RealmPhase::New,
                s2sz,
                start_level,
                num_start,
                rtt_base,
                aux_rtt,
                tree_per_plane,
                trees,
                data: BTreeMap::new(),
                ripas: BTreeMap::new(),
                recs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn realm_destroy(&mut self, rd: u64) -> RmiResult {
        let realm = self.realm(rd)?;
        if !realm.recs.is_empty()
            || !realm.data.is_empty()
            || !realm.trees.iter().all(TreeModel::is_empty)
        {
            return Err(RmiError::Realm(0));
        }
        let realm = self.realms.remove(&rd).unwrap();
        let mut roots = alloc::vec![realm.rtt_base];
        roots.extend_from_slice(&realm.aux_rtt);
        for base in roots {
            for i in 0..realm.num_start {
                self.release_to_delegated(base + i * GRANULE_SIZE);
            }
        }
        self.release_to_delegated(rd);
        Ok(())
    }

    fn realm_activate(&mut self, rd: u64) -> RmiResult {
        let realm = self.realm(rd)?;
        if realm.phase != RealmPhase::New {
            return Err(RmiError::Realm(0));
        }
        realm.phase = RealmPhase::Active;
        Ok(())
    }

    fn rec_create(&mut self, rd: u64, rec: u64, params_ptr: u64) -> RmiResult {
        if self.granule(rec) != Some(GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        {
            let realm = self.realm(rd)?;
            if realm.phase != RealmPhase::New {
                return Err(RmiError::Realm(0));
            }
        }
        let (flags, mpidr, num_aux, aux) = {
            let arena = self.arena.borrow();
            let flags = arena.read_u64(params_ptr + run::rec_params::FLAGS);
            let mpidr = arena.read_u64(params_ptr + run::rec_params::MPIDR);
            let num_aux = arena.read_u64(params_ptr + run::rec_params::NUM_AUX);
            let mut aux = Vec::new();
            for i in 0..num_aux {
                aux.push(arena.read_u64(params_ptr + run::rec_params::AUX + 8 * i));
            }
            (flags, mpidr, num_aux, aux)
        };
        if num_aux != self.rec_aux_count {
            return Err(RmiError::Input);
        }
        if self
            .realms
            .get(&rd)
            .is_some_and(|r| r.recs.values().any(|m| m.mpidr == mpidr))
        {
            return Err(RmiError::Input);
        }
        for &a in &aux {
            if self.granule(a) != Some(GranuleState::Delegated) {
                return Err(RmiError::Input);
            }
        }
        for &a in &aux {
            self.granules.insert(a, GranuleState::RecAux);
        }
        self.granules.insert(rec, GranuleState::Rec);
        let model = RecModel {
            mpidr,
            runnable: flags & run::rec_params::FLAG_RUNNABLE != 0,
            aux,
            script: VecDeque::new(),
            pending_ripas: None,
            pending_s2ap: None,
            pending_fault: None,
            pending_psci: None,
        };
        self.realm(rd)?.recs.insert(rec, model);
        Ok(())
    }

    fn rec_destroy(&mut self, rec: u64) -> RmiResult {
        if self.granule(rec) != Some(GranuleState::Rec) {
            return Err(RmiError::Input);
        }
        let realm = self.realm_of_rec(rec)?;
        let model = realm.recs.remove(&rec).unwrap();
        for a in model.aux {
            self.release_to_delegated(a);
        }
        self.release_to_delegated(rec);
        Ok(())
    }

    fn data_create(&mut self, unknown: bool, args: &CallArgs) -> RmiResult {
        let (rd, data, map_addr, src) = (args[0], args[1], args[2], args[3]);
        if self.granule(data) != Some(GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        let realm = self.realm(rd)?;
        // Both variants attach initial content; neither is legal once
        // the realm's measurement is sealed.
        if realm.phase != RealmPhase::New {
            return Err(RmiError::Realm(0));
        }
        if !is_aligned(map_addr, GRANULE_SIZE) || map_addr >= realm.protected_top() {
            return Err(RmiError::Input);
        }
        realm.walk(0, map_addr, RTT_PAGE_LEVEL).map_err(RmiError::Rtt)?;
        if realm.data.contains_key(&map_addr) {
            return Err(RmiError::Rtt(RTT_PAGE_LEVEL));
        }
        realm.data.insert(map_addr, data);
        if unknown {
            // Content state is whatever the host declared beforehand.
        } else {
            realm.ripas.insert(map_addr, ripas::RAM);
            self.arena.borrow_mut().copy_page(src, data);
        }
        self.granules.insert(data, GranuleState::Data);
        Ok(())
    }

    fn data_destroy(&mut self, rd: u64, map_addr: u64) -> RmiResult<(u64, u64)> {
        let realm = self.realm(rd)?;
        realm.walk(0, map_addr, RTT_PAGE_LEVEL).map_err(RmiError::Rtt)?;
        let Some(data) = realm.data.remove(&map_addr) else {
            return Err(RmiError::Rtt(RTT_PAGE_LEVEL));
        };
        realm.ripas.insert(map_addr, ripas::DESTROYED);
        self.release_to_delegated(data);
        Ok((data, map_addr + GRANULE_SIZE))
    }

    fn tree_index(realm: &RealmModel, index: u64) -> RmiResult<usize> {
        let index = index as usize;
        if index >= realm.trees.len() {
            return Err(RmiError::Input);
        }
        Ok(index)
    }

    fn rtt_create(&mut self, rd: u64, rtt: u64, map_addr: u64, level: i8, index: u64) -> RmiResult {
        if self.granule(rtt) != Some(GranuleState::Delegated) {
            return Err(RmiError::Input);
        }
        let walk_err = |l, index| {
            if index == 0 {
                RmiError::Rtt(l)
            } else {
                RmiError::RttAux(l)
            }
        };
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        if level <= realm.start_level || level > RTT_PAGE_LEVEL {
            return Err(RmiError::Input);
        }
        realm
            .walk(tree, map_addr, level - 1)
            .map_err(|l| walk_err(l, index))?;
        let key = (level, align_down(map_addr, rtt_map_size(level - 1)));
        if realm.trees[tree].nodes.contains_key(&key) {
            return Err(walk_err(level, index));
        }
        // Creating a table under a block entry unfolds it; the
        // per-page data and content states were never discarded.
        realm.trees[tree].blocks.remove(&(level - 1, key.1));
        realm.trees[tree].nodes.insert(key, rtt);
        self.granules.insert(rtt, GranuleState::RttNode);
        Ok(())
    }

    /// Whether the node at `(level, base)` of `tree` has any children,
    /// mappings or live data below it.
    fn node_is_live(realm: &RealmModel, tree: usize, level: i8, base: u64) -> bool {
        let end = base + rtt_map_size(level - 1);
        let t = &realm.trees[tree];
        let has_children = level < RTT_PAGE_LEVEL
            && t.nodes
                .range((level + 1, 0)..=(RTT_PAGE_LEVEL, u64::MAX))
                .any(|(&(_, b), _)| b >= base && b < end);
        let has_blocks = t
            .blocks
            .iter()
            .any(|&(l, b)| l >= level && b >= base && b < end);
        let has_ns = t.ns.range(base..end).next().is_some();
        let has_mirrored = t.mirrored.range(base..end).next().is_some();
        let has_data = tree == 0 && realm.data.range(base..end).next().is_some();
        has_children || has_blocks || has_ns || has_mirrored || has_data
    }

    fn rtt_destroy(&mut self, rd: u64, map_addr: u64, level: i8, index: u64) -> RmiResult<(u64, u64)> {
        let walk_err = |l| {
            if index == 0 {
                RmiError::Rtt(l)
            } else {
                RmiError::RttAux(l)
            }
        };
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        let base = align_down(map_addr, rtt_map_size(level - 1));
        let key = (level, base);
        if !realm.trees[tree].nodes.contains_key(&key) {
            return Err(walk_err(realm.walk(tree, map_addr, level).err().unwrap_or(level)));
        }
        if Self::node_is_live(realm, tree, level, base) {
            return Err(walk_err(level));
        }
        let node = realm.trees[tree].nodes.remove(&key).unwrap();
        self.release_to_delegated(node);
        Ok((node, base + rtt_map_size(level - 1)))
    }

    fn rtt_fold(&mut self, rd: u64, map_addr: u64, level: i8, index: u64) -> RmiResult<u64> {
        let walk_err = |l| {
            if index == 0 {
                RmiError::Rtt(l)
            } else {
                RmiError::RttAux(l)
            }
        };
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        let base = align_down(map_addr, rtt_map_size(level - 1));
        let end = base + rtt_map_size(level - 1);
        let key = (level, base);
        if !realm.trees[tree].nodes.contains_key(&key) {
            return Err(walk_err(level - 1));
        }
        // Folding requires a homogeneous table: no child tables, no
        // unprotected or mirrored mappings, and either every entry
        // assigned with one content state (fold to a block) or none.
        {
            let t = &realm.trees[tree];
            let has_children = level < RTT_PAGE_LEVEL
                && t.nodes
                    .range((level + 1, 0)..=(RTT_PAGE_LEVEL, u64::MAX))
                    .any(|(&(_, b), _)| b >= base && b < end);
            let has_blocks = t.blocks.iter().any(|&(l, b)| l >= level && b >= base && b < end);
            let has_ns = t.ns.range(base..end).next().is_some();
            let has_mirrored = t.mirrored.range(base..end).next().is_some();
            if has_children || has_blocks || has_ns || has_mirrored {
                return Err(walk_err(level));
            }
        }
        let pages = (end - base) / GRANULE_SIZE;
        let assigned = if tree == 0 {
            realm.data.range(base..end).count() as u64
        } else {
            0
        };
        if assigned == pages {
            // Fully assigned: the output addresses must be contiguous
            // and the content state uniform across the whole range.
            let first_pa = realm.data[&base];
            let first_state = realm.ripas.get(&base).copied().unwrap_or(ripas::EMPTY);
            for i in 0..pages {
                let page = base + i * GRANULE_SIZE;
                if realm.data.get(&page) != Some(&(first_pa + i * GRANULE_SIZE))
                    || realm.ripas.get(&page).copied().unwrap_or(ripas::EMPTY) != first_state
                {
                    return Err(walk_err(level));
                }
            }
            realm.trees[tree].blocks.insert((level - 1, base));
        } else if assigned == 0 {
            let mut states = realm.ripas.range(base..end).map(|(_, &v)| v);
            if let Some(first) = states.next() {
                if states.any(|v| v != first) {
                    return Err(walk_err(level));
                }
                let covered = realm.ripas.range(base..end).count() as u64;
                if first != ripas::EMPTY && covered < pages {
                    return Err(walk_err(level));
                }
            }
        } else {
            return Err(walk_err(level));
        }
        let node = realm.trees[tree].nodes.remove(&key).unwrap();
        self.release_to_delegated(node);
        Ok(node)
    }

    fn rtt_read_entry(&mut self, rd: u64, map_addr: u64, level: i8, index: u64) -> RmiResult<[u64; 4]> {
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        let walk_level = match realm.walk(tree, map_addr, level) {
            Ok(()) => level,
            Err(stopped) => stopped,
        };
        let page = align_down(map_addr, GRANULE_SIZE);
        let ripas_at = |realm: &RealmModel, addr: u64| {
            realm.ripas.get(&addr).copied().unwrap_or(ripas::EMPTY)
        };
        // Does a child table hang off the entry at walk_level?
        let entry_base = align_down(map_addr, rtt_map_size(walk_level));
        let child_key = (walk_level + 1, entry_base);
        if walk_level < RTT_PAGE_LEVEL {
            if let Some(&node) = realm.trees[tree].nodes.get(&child_key) {
                return Ok([walk_level as u64, hipas::TABLE, node, ripas::EMPTY]);
            }
            if realm.trees[tree].blocks.contains(&(walk_level, entry_base)) {
                return Ok([
                    walk_level as u64,
                    hipas::ASSIGNED,
                    realm.data.get(&entry_base).copied().unwrap_or(0),
                    ripas_at(realm, entry_base),
                ]);
            }
            return Ok([
                walk_level as u64,
                hipas::UNASSIGNED,
                0,
                ripas_at(realm, align_down(map_addr, rtt_map_size(walk_level))),
            ]);
        }
        let (state, out) = if tree == 0 {
            match realm.data.get(&page) {
                Some(&pa) => (hipas::ASSIGNED, pa),
                None => match realm.trees[tree].ns.get(&page) {
                    Some(&desc) => (hipas::ASSIGNED, align_down(desc, GRANULE_SIZE)),
                    None => (hipas::UNASSIGNED, 0),
                },
            }
        } else if realm.trees[tree].mirrored.contains(&page) {
            (hipas::ASSIGNED, realm.data.get(&page).copied().unwrap_or(0))
        } else {
            match realm.trees[tree].ns.get(&page) {
                Some(&desc) => (hipas::ASSIGNED, align_down(desc, GRANULE_SIZE)),
                None => (hipas::UNASSIGNED, 0),
            }
        };
        Ok([walk_level as u64, state, out, ripas_at(realm, page)])
    }

    fn rtt_map_unprotected(&mut self, rd: u64, map_addr: u64, desc: u64, index: u64) -> RmiResult {
        let walk_err = |l| {
            if index == 0 {
                RmiError::Rtt(l)
            } else {
                RmiError::RttAux(l)
            }
        };
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        if !is_aligned(map_addr, GRANULE_SIZE) || map_addr < realm.protected_top() {
            return Err(RmiError::Input);
        }
        realm.walk(tree, map_addr, RTT_PAGE_LEVEL).map_err(walk_err)?;
        if realm.trees[tree].ns.contains_key(&map_addr) {
            return Err(walk_err(RTT_PAGE_LEVEL));
        }
        realm.trees[tree].ns.insert(map_addr, desc);
        Ok(())
    }

    fn rtt_unmap_unprotected(&mut self, rd: u64, map_addr: u64, index: u64) -> RmiResult<u64> {
        let walk_err = |l| {
            if index == 0 {
                RmiError::Rtt(l)
            } else {
                RmiError::RttAux(l)
            }
        };
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        if let Err(stopped) = realm.walk(tree, map_addr, RTT_PAGE_LEVEL) {
            return Err(walk_err(stopped));
        }
        if realm.trees[tree].ns.remove(&map_addr).is_none() {
            return Err(walk_err(RTT_PAGE_LEVEL));
        }
        Ok(map_addr + GRANULE_SIZE)
    }

    fn rtt_aux_map_protected(&mut self, rd: u64, map_addr: u64, index: u64) -> RmiResult {
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        if tree == 0 {
            return Err(RmiError::Input);
        }
        if !realm.data.contains_key(&map_addr) {
            return Err(RmiError::Input);
        }
        realm
            .walk(tree, map_addr, RTT_PAGE_LEVEL)
            .map_err(RmiError::RttAux)?;
        realm.trees[tree].mirrored.insert(map_addr);
        Ok(())
    }

    fn rtt_aux_unmap_protected(&mut self, rd: u64, map_addr: u64, index: u64) -> RmiResult<u64> {
        let realm = self.realm(rd)?;
        let tree = Self::tree_index(realm, index)?;
        if tree == 0 || !realm.trees[tree].mirrored.remove(&map_addr) {
            return Err(RmiError::RttAux(RTT_PAGE_LEVEL));
        }
        Ok(map_addr + GRANULE_SIZE)
    }

    /// Applies a content-state walk over `[start, end)`, stopping at a
    /// missing table or at the next table boundary. Returns how far it
    /// got.
    fn apply_ripas(realm: &mut RealmModel, start: u64, end: u64, value: u64) -> RmiResult<u64> {
        if let Err(stopped) = realm.walk(0, start, RTT_PAGE_LEVEL) {
            return Err(RmiError::Rtt(stopped));
        }
        // One call never crosses a leaf-table boundary, so the host's
        // progress loop is exercised on multi-table ranges.
        let boundary = align_up(start + 1, rtt_map_size(RTT_PAGE_LEVEL - 1));
        let top = end.min(boundary);
        let mut addr = start;
        while addr < top {
            realm.ripas.insert(addr, value);
            addr += GRANULE_SIZE;
        }
        Ok(top)
    }

    fn rtt_init_ripas(&mut self, rd: u64, start: u64, end: u64) -> RmiResult<u64> {
        let realm = self.realm(rd)?;
        if realm.phase != RealmPhase::New {
            return Err(RmiError::Realm(0));
        }
        if !is_aligned(start, GRANULE_SIZE) || !is_aligned(end, GRANULE_SIZE) || start >= end {
            return Err(RmiError::Input);
        }
        if end > realm.protected_top() {
            return Err(RmiError::Input);
        }
        Self::apply_ripas(realm, start, end, ripas::RAM)
    }

    fn rtt_set_ripas(&mut self, rd: u64, rec: u64, start: u64, end: u64) -> RmiResult<u64> {
        let realm = self.realm(rd)?;
        let Some(model) = realm.recs.get(&rec) else {
            return Err(RmiError::Input);
        };
        let Some((base, size, value)) = model.pending_ripas else {
            return Err(RmiError::Rec);
        };
        if start < base || end > base + size {
            return Err(RmiError::Rec);
        }
        let top = Self::apply_ripas(realm, start, end, value)?;
        let model = realm.recs.get_mut(&rec).unwrap();
        if top >= base + size {
            model.pending_ripas = None;
        }
        Ok(top)
    }

    fn rtt_set_s2ap(&mut self, rd: u64, rec: u64, start: u64, end: u64) -> RmiResult<u64> {
        let realm = self.realm(rd)?;
        let Some(model) = realm.recs.get(&rec) else {
            return Err(RmiError::Input);
        };
        let Some((base, pending_top, plane)) = model.pending_s2ap else {
            return Err(RmiError::Rec);
        };
        if start < base || end > pending_top {
            return Err(RmiError::Rec);
        }
        let tree = if realm.tree_per_plane && plane > 0 {
            plane as usize
        } else {
            0
        };
        if let Err(stopped) = realm.walk(tree, start, RTT_PAGE_LEVEL) {
            return Err(if tree == 0 {
                RmiError::Rtt(stopped)
            } else {
                RmiError::RttAux(stopped)
            });
        }
        let boundary = align_up(start + 1, rtt_map_size(RTT_PAGE_LEVEL - 1));
        let top = end.min(boundary);
        let model = realm.recs.get_mut(&rec).unwrap();
        if top >= pending_top {
            model.pending_s2ap = None;
        }
        Ok(top)
    }

    fn rec_aux_count(&mut self, rd: u64) -> RmiResult<u64> {
        self.realm(rd)?;
        Ok(self.rec_aux_count)
    }

    fn psci_complete(&mut self, calling: u64, target: u64, status: u64) -> RmiResult {
        let realm = self.realm_of_rec(calling)?;
        let Some(psci_fid) = realm.recs.get(&calling).and_then(|r| r.pending_psci) else {
            return Err(RmiError::Input);
        };
        realm.recs.get_mut(&calling).unwrap().pending_psci = None;
        if psci_fid == 0xC400_0003 && status == 0 {
            if let Some(t) = realm.recs.get_mut(&target) {
                t.runnable = true;
            }
        }
        Ok(())
    }

    fn rec_enter(&mut self, rec: u64, run_ptr: u64) -> RmiResult {
        if self.granule(rec) != Some(GranuleState::Rec) {
            return Err(RmiError::Input);
        }
        let arena = alloc::rc::Rc::clone(&self.arena);
        let entry_flags = arena.borrow().read_u64(run_ptr + run::entry::FLAGS);
        let reject = entry_flags & run::RecEntryFlags::RIPAS_RESPONSE_REJECT.bits() != 0;

        let realm = self.realm_of_rec(rec)?;
        if realm.phase != RealmPhase::Active {
            return Err(RmiError::Realm(0));
        }

        // The previous exit must have been serviced.
        {
            let model = realm.recs.get(&rec).unwrap();
            if !model.runnable {
                return Err(RmiError::Rec);
            }
            if model.pending_ripas.is_some() && !reject {
                return Err(RmiError::Rec);
            }
            if model.pending_s2ap.is_some() || model.pending_psci.is_some() {
                return Err(RmiError::Rec);
            }
            if let Some((ipa, plane)) = model.pending_fault {
                let mirrored = realm
                    .trees
                    .get(plane as usize)
                    .is_some_and(|t| t.mirrored.contains(&ipa));
                if !mirrored {
                    return Err(RmiError::Rec);
                }
            }
        }
        {
            let model = realm.recs.get_mut(&rec).unwrap();
            model.pending_ripas = None;
            model.pending_fault = None;
        }

        let exit = realm
            .recs
            .get_mut(&rec)
            .unwrap()
            .script
            .pop_front()
            .unwrap_or(ScriptedExit::HostCall {
                imm: crate::rec::host_call::EXIT_SUCCESS,
                gprs: [0; 8],
            });

        write_exit(&mut arena.borrow_mut(), run_ptr, &exit);

        let model = realm.recs.get_mut(&rec).unwrap();
        match exit {
            ScriptedExit::RipasChange { base, size, value } => {
                model.pending_ripas = Some((base, size, value));
            }
            ScriptedExit::S2apChange { base, top, plane } => {
                model.pending_s2ap = Some((base, top, plane));
            }
            ScriptedExit::PlaneFault { ipa, plane } => {
                model.pending_fault = Some((ipa, plane));
            }
            ScriptedExit::Power { psci_fid, .. } => {
                // System shutdown needs no completion call.
                if psci_fid != 0x8400_0008 {
                    model.pending_psci = Some(psci_fid);
                }
            }
            ScriptedExit::HostCall { .. } | ScriptedExit::Interrupt => {}
        }
        Ok(())
    }
}

/// Writes the exit half of the run record for a scripted exit.
fn write_exit(arena: &mut Arena, run_ptr: u64, exit: &ScriptedExit) {
    // Clear the whole exit half first.
    let zero = [0u8; 0x800];
    arena.write(run_ptr + run::EXIT_BASE, &zero);
    match *exit {
        ScriptedExit::HostCall { imm, gprs } => {
            arena.write_u64(run_ptr + run::exit::REASON, 5);
            arena.write_u64(run_ptr + run::exit::IMM, imm);
            for (i, g) in gprs.iter().enumerate() {
                arena.write_u64(run_ptr + run::exit::GPRS + 8 * i as u64, *g);
            }
        }
        ScriptedExit::RipasChange { base, size, value } => {
            arena.write_u64(run_ptr + run::exit::REASON, 4);
            arena.write_u64(run_ptr + run::exit::RIPAS_BASE, base);
            arena.write_u64(run_ptr + run::exit::RIPAS_SIZE, size);
            arena.write_u64(run_ptr + run::exit::RIPAS_VALUE, value);
        }
        ScriptedExit::S2apChange { base, top, plane } => {
            arena.write_u64(run_ptr + run::exit::REASON, 7);
            arena.write_u64(run_ptr + run::exit::S2AP_BASE, base);
            arena.write_u64(run_ptr + run::exit::S2AP_TOP, top);
            arena.write_u64(run_ptr + run::exit::PLANE, plane);
        }
        ScriptedExit::PlaneFault { ipa, plane } => {
            arena.write_u64(run_ptr + run::exit::REASON, 0);
            // Lower-EL data abort, stage-2 translation fault, level 3.
            arena.write_u64(run_ptr + run::exit::ESR, (0x24 << 26) | 0x7);
            arena.write_u64(run_ptr + run::exit::FAR, ipa & (GRANULE_SIZE - 1));
            arena.write_u64(run_ptr + run::exit::HPFAR, (ipa >> 12) << 4);
            arena.write_u64(run_ptr + run::exit::PLANE, plane);
        }
        ScriptedExit::Interrupt => {
            arena.write_u64(run_ptr + run::exit::REASON, 1);
        }
        ScriptedExit::Power { psci_fid, target_mpidr } => {
            arena.write_u64(run_ptr + run::exit::REASON, 3);
            arena.write_u64(run_ptr + run::exit::GPRS, psci_fid);
            arena.write_u64(run_ptr + run::exit::GPRS + 8, target_mpidr);
        }
    }
}

impl Monitor for MockRmm {
    fn call(&mut self, call_fid: u64, args: &CallArgs) -> CallRets {
        let mut rets = [0u64; CALL_RET_WORDS];

        if let Some((fail_fid, error)) = self.fail_next {
            if fail_fid == call_fid {
                self.fail_next = None;
                rets[0] = encode_status(Err(error));
                return rets;
            }
        }

        let status: RmiResult = match call_fid {
            fid::VERSION => {
                rets[1] = abi_version(1, 1);
                Ok(())
            }
            fid::FEATURES => {
                rets[1] = if args[0] == 0 { self.features0 } else { 0 };
                Ok(())
            }
            fid::GRANULE_DELEGATE => self.delegate(args[0]),
            fid::GRANULE_UNDELEGATE => self.undelegate(args[0]),
            fid::REALM_CREATE => self.realm_create(args[0], args[1]),
            fid::REALM_DESTROY => self.realm_destroy(args[0]),
            fid::REALM_ACTIVATE => self.realm_activate(args[0]),
            fid::REC_AUX_COUNT => self.rec_aux_count(args[0]).map(|v| rets[1] = v),
            fid::REC_CREATE => self.rec_create(args[0], args[1], args[2]),
            fid::REC_DESTROY => self.rec_destroy(args[0]),
            fid::REC_ENTER => self.rec_enter(args[0], args[1]),
            fid::PSCI_COMPLETE => self.psci_complete(args[0], args[1], args[2]),
            fid::DATA_CREATE => self.data_create(false, args),
            fid::DATA_CREATE_UNKNOWN => self.data_create(true, args),
            fid::DATA_DESTROY => self.data_destroy(args[0], args[1]).map(|(pa, top)| {
                rets[1] = pa;
                rets[2] = top;
            }),
            fid::RTT_CREATE => self.rtt_create(args[0], args[1], args[2], args[3] as i8, 0),
            fid::RTT_AUX_CREATE => {
                self.rtt_create(args[0], args[1], args[2], args[3] as i8, args[4])
            }
            fid::RTT_DESTROY => self.rtt_destroy(args[0], args[1], args[2] as i8, 0).map(
                |(pa, top)| {
                    rets[1] = pa;
                    rets[2] = top;
                },
            ),
            fid::RTT_AUX_DESTROY => self
                .rtt_destroy(args[0], args[1], args[2] as i8, args[3])
                .map(|(pa, top)| {
                    rets[1] = pa;
                    rets[2] = top;
                }),
            fid::RTT_FOLD => self
                .rtt_fold(args[0], args[1], args[2] as i8, 0)
                .map(|pa| rets[1] = pa),
            fid::RTT_AUX_FOLD => self
                .rtt_fold(args[0], args[1], args[2] as i8, args[3])
                .map(|pa| rets[1] = pa),
            fid::RTT_READ_ENTRY => {
                self.rtt_read_entry(args[0], args[1], args[2] as i8, args[3]).map(|words| {
                    rets[1..5].copy_from_slice(&words);
                })
            }
            fid::RTT_MAP_UNPROTECTED => {
                // args: rd, map_addr, level, desc. Pages only.
                if args[2] as i8 != RTT_PAGE_LEVEL {
                    Err(RmiError::Input)
                } else {
                    self.rtt_map_unprotected(args[0], args[1], args[3], 0)
                }
            }
            fid::RTT_AUX_MAP_UNPROTECTED => {
                self.rtt_map_unprotected(args[0], args[1], args[2], args[3])
            }
            fid::RTT_UNMAP_UNPROTECTED => self
                .rtt_unmap_unprotected(args[0], args[1], 0)
                .map(|top| rets[1] = top),
            fid::RTT_AUX_UNMAP_UNPROTECTED => self
                .rtt_unmap_unprotected(args[0], args[1], args[2])
                .map(|top| rets[1] = top),
            fid::RTT_AUX_MAP_PROTECTED => self.rtt_aux_map_protected(args[0], args[1], args[2]),
            fid::RTT_AUX_UNMAP_PROTECTED => self
                .rtt_aux_unmap_protected(args[0], args[1], args[2])
                .map(|top| rets[1] = top),
            fid::RTT_INIT_RIPAS => self
                .rtt_init_ripas(args[0], args[1], args[2])
                .map(|top| rets[1] = top),
            fid::RTT_SET_RIPAS => self
                .rtt_set_ripas(args[0], args[1], args[2], args[3])
                .map(|top| rets[1] = top),
            fid::RTT_SET_S2AP => self
                .rtt_set_s2ap(args[0], args[1], args[2], args[3])
                .map(|top| rets[1] = top),
            _ => Err(RmiError::NotSupported),
        };
        rets[0] = encode_status(status);
        rets
    }
}
