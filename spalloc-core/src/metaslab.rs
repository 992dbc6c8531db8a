// vim: tw=80
//! Metaslabs: the unit of free space tracking
//!
//! A metaslab is a fixed, power-of-two sized slice of one device.  It tracks
//! its own free space in a set of range trees, persists changes to its own
//! space map (or to the pool-wide log), and carries a weight that ranks it
//! within its group.
//!
//! Lock order: `sync_lock`, then the metaslab's own lock, then any group,
//! class, or log lock.

use std::{
    fmt::{self, Display, Formatter},
    iter,
    mem,
    sync::{
        Condvar,
        Mutex,
        MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tracing::{debug, trace, warn};
use crate::{
    allocator::{AllocStrategyApi, MAX_LBAS, StrategyArgs},
    group::Group,
    range_tree::RangeTree,
    space_map::{MapType, SpaceMap},
    tunables::Tunables,
    types::*,
    util::p2phase,
    weight::*,
};

/// Marks an unset timestamp hint
const NEVER: u64 = u64::MAX;

type MsGuard<'a> = MutexGuard<'a, MsInner>;

/// Whether the in-core free space index is authoritative
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LoadState {
    #[default]
    Unloaded,
    /// Some thread is reading the space map
    Loading,
    Loaded,
}

impl Display for LoadState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
        };
        f.pad(s)
    }
}

/// Exclusive space map rewrites that run with the metaslab lock dropped
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum SyncPhase {
    #[default]
    Idle,
    Condensing,
    Flushing,
}

/// Copies of a few fields that may be read without the metaslab lock, by
/// threads holding the group lock.
#[derive(Debug)]
struct MsHints {
    new: AtomicBool,
    loaded: AtomicBool,
    condensing: AtomicBool,
    disabled: AtomicBool,
    condense_wanted: AtomicBool,
    max_size: AtomicU64,
    unload_time: AtomicU64,
    selected_time: AtomicU64,
    allocated: AtomicU64,
}

impl Default for MsHints {
    fn default() -> Self {
        MsHints {
            new: AtomicBool::new(true),
            loaded: AtomicBool::new(false),
            condensing: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            condense_wanted: AtomicBool::new(false),
            max_size: AtomicU64::new(0),
            unload_time: AtomicU64::new(NEVER),
            selected_time: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
struct MsInner {
    state: LoadState,
    phase: SyncPhase,
    new: bool,
    /// Nesting count of `disable` calls
    disabled: u32,
    weight: Weight,
    activation: Activation,
    allocator: Option<usize>,
    /// Weight at the time of activation
    activation_weight: Option<Weight>,
    fragmentation: Option<u64>,
    /// Largest free segment.  Exact when loaded, a lower bound otherwise.
    max_size: u64,
    /// Free space available for allocation right now.  Only populated while
    /// loaded.
    allocatable: RangeTree,
    /// Allocations by txg, not yet synced
    allocating: [RangeTree; TXG_SIZE],
    allocating_total: u64,
    /// Frees by txg, not yet synced
    freeing: [RangeTree; TXG_SIZE],
    /// Frees synced in the current txg, not yet deferred
    freed: RangeTree,
    /// Frees of blocks that the checkpoint still references
    checkpointing: RangeTree,
    defer: [RangeTree; TXG_DEFER_SIZE],
    deferspace: u64,
    /// Freed ranges not yet trimmed
    trim: RangeTree,
    /// Changes recorded in the pool-wide log but not yet in our space map
    unflushed_allocs: RangeTree,
    unflushed_frees: RangeTree,
    /// When our space map last absorbed the pool-wide log.  Zero if never.
    unflushed_txg: TxgT,
    sm: Option<SpaceMap>,
    /// Space map length as of the last completed sync
    synced_length: u64,
    cursors: [u64; MAX_LBAS],
    /// Allocated space according to the space map plus unflushed changes
    allocated_space: u64,
    allocated_this_txg: u64,
    unload_time: Option<u64>,
    selected_txg: TxgT,
    selected_time: u64,
    condense_wanted: bool,
}

impl MsInner {
    fn new(floor_shift: u32) -> Self {
        MsInner {
            state: LoadState::Unloaded,
            phase: SyncPhase::Idle,
            new: true,
            disabled: 0,
            weight: Weight::ZERO,
            activation: Activation::Inactive,
            allocator: None,
            activation_weight: None,
            fragmentation: None,
            max_size: 0,
            allocatable: RangeTree::with_size_index(floor_shift),
            allocating: Default::default(),
            allocating_total: 0,
            freeing: Default::default(),
            freed: RangeTree::new(),
            checkpointing: RangeTree::new(),
            defer: Default::default(),
            deferspace: 0,
            trim: RangeTree::new(),
            unflushed_allocs: RangeTree::new(),
            unflushed_frees: RangeTree::new(),
            unflushed_txg: TxgT(0),
            sm: None,
            synced_length: 0,
            cursors: [0; MAX_LBAS],
            allocated_space: 0,
            allocated_this_txg: 0,
            unload_time: None,
            selected_txg: TxgT(0),
            selected_time: 0,
            condense_wanted: false,
        }
    }

    fn loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    fn unflushed_mem(&self) -> u64 {
        self.unflushed_allocs.mem_used() + self.unflushed_frees.mem_used()
    }

    fn largest_allocatable(&mut self) -> u64 {
        self.allocatable.largest().map(|(_, l)| l).unwrap_or(0)
    }

    /// The largest unflushed free that is not also deferred or freed.
    ///
    /// Only the largest unflushed segment is considered, and it is clipped
    /// at the first overlap, so the result is a lower bound.
    fn largest_unflushed_free(&mut self) -> u64 {
        let Some((start, mut size)) = self.unflushed_frees.largest() else {
            return 0;
        };
        for d in self.defer.iter() {
            if let Some((s, _)) = d.find_in(start, size) {
                if s == start {
                    return 0;
                }
                size = s - start;
            }
        }
        if let Some((s, _)) = self.freed.find_in(start, size) {
            size = s - start;
        }
        size
    }
}

/// Everything needed to read a space map without holding the metaslab lock
#[derive(Debug)]
struct LoadTicket {
    sm: Option<SpaceMap>,
    /// Only entries synced before the load began are read.
    length: u64,
}

/// A point-in-time description of one metaslab
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetaslabInfo {
    pub id: u64,
    pub start: u64,
    pub size: u64,
    pub sm_object: Option<ObjectT>,
    pub state: LoadState,
    pub activation: Activation,
    pub weight: Weight,
    pub fragmentation: Option<u64>,
    pub allocated: u64,
    /// Allocatable space.  Only known while loaded.
    pub free: Option<u64>,
    pub deferred: u64,
    pub max_size: u64,
    pub disabled: bool,
}

/// Space accounting of a loaded metaslab, by category
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SpaceSummary {
    pub allocated: u64,
    pub allocatable: u64,
    pub allocating: u64,
    pub deferred: u64,
    pub freed: u64,
}

impl SpaceSummary {
    pub fn total(&self) -> u64 {
        self.allocated + self.allocatable + self.allocating + self.deferred +
            self.freed
    }
}

#[derive(Debug)]
pub struct Metaslab {
    id: u64,
    start: u64,
    size: u64,
    inner: Mutex<MsInner>,
    /// Signalled whenever a load, condense, or flush finishes
    cv: Condvar,
    /// Serializes space map writers with each other and with the end of a
    /// load.
    sync_lock: Mutex<()>,
    hints: MsHints,
}

impl Metaslab {
    /// Construct a metaslab, opening its space map if it has one.
    ///
    /// The metaslab isn't usable until [`Metaslab::init`] runs.
    pub(crate) fn new(mg: &Group, id: u64, sm_object: Option<ObjectT>)
        -> Result<Self>
    {
        let t = mg.ctx.tunables.load();
        let size = mg.config.ms_size();
        let start = id * size;
        let mut inner = MsInner::new(t.size_index_floor_shift);
        if let Some(object) = sm_object {
            let sm = SpaceMap::open(&*mg.ctx.store, object, start, size,
                mg.config.ashift)?;
            inner.allocated_space = u64::try_from(sm.allocated())
                .map_err(|_| Error::EINTEGRITY)?;
            inner.synced_length = sm.length();
            inner.sm = Some(sm);
        }
        Ok(Metaslab {
            id,
            start,
            size,
            inner: Mutex::new(inner),
            cv: Condvar::new(),
            sync_lock: Mutex::new(()),
            hints: MsHints::default(),
        })
    }

    /// Make a freshly constructed metaslab known to its group.
    ///
    /// Metaslabs of a new pool, or of one being opened, are usable at once.
    /// Those of a device added to a running pool become usable only once
    /// `txg` syncs.
    pub(crate) fn init(&self, mg: &Group, txg: TxgT) {
        if txg <= TXG_INITIAL {
            self.sync_done(mg, TxgT(0));
            let allocated = self.inner.lock().unwrap().allocated_space;
            mg.space_update(allocated as i64, 0, 0);
        }
        if txg != TxgT(0) {
            mg.dirty(self.id, txg);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn set_hints(&self, ms: &MsInner) {
        let h = &self.hints;
        h.new.store(ms.new, Ordering::Relaxed);
        h.loaded.store(ms.loaded(), Ordering::Relaxed);
        h.condensing.store(ms.phase == SyncPhase::Condensing,
            Ordering::Relaxed);
        h.disabled.store(ms.disabled > 0, Ordering::Relaxed);
        h.condense_wanted.store(ms.condense_wanted, Ordering::Relaxed);
        h.max_size.store(ms.max_size, Ordering::Relaxed);
        h.unload_time.store(ms.unload_time.unwrap_or(NEVER),
            Ordering::Relaxed);
        h.selected_time.store(ms.selected_time, Ordering::Relaxed);
        h.allocated.store(ms.allocated_space, Ordering::Relaxed);
    }

    /// Is this metaslab being condensed or disabled?  May be called without
    /// the metaslab lock.
    pub(crate) fn is_unavailable(&self) -> bool {
        self.hints.condensing.load(Ordering::Relaxed) ||
            self.hints.disabled.load(Ordering::Relaxed)
    }

    pub(crate) fn condense_wanted(&self) -> bool {
        self.hints.condense_wanted.load(Ordering::Relaxed)
    }

    pub(crate) fn has_allocations(&self) -> bool {
        self.hints.allocated.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn selected_time(&self) -> u64 {
        self.hints.selected_time.load(Ordering::Relaxed)
    }

    /// Could this metaslab plausibly satisfy an allocation of `asize`?
    ///
    /// Never loads anything.  A loaded metaslab knows its largest segment
    /// exactly.  An unloaded one trusts its last known largest segment for a
    /// while, and after that relies on `weight`.
    pub(crate) fn should_allocate(&self, weight: Weight, asize: u64,
        try_hard: bool, now: u64, t: &Tunables) -> bool
    {
        let h = &self.hints;
        if h.new.load(Ordering::Relaxed) {
            return false;
        }
        let max_size = h.max_size.load(Ordering::Relaxed);
        let unload_time = h.unload_time.load(Ordering::Relaxed);
        let cached = max_size != 0 && !try_hard && unload_time != NEVER &&
            now < unload_time.saturating_add(t.max_size_cache_sec * 1000);
        if h.loaded.load(Ordering::Relaxed) || cached {
            max_size >= asize
        } else {
            weight.may_fit(asize)
        }
    }

    /// Compute a new weight, also refreshing fragmentation and `max_size`.
    fn calculate_weight(&self, mg: &Group, ms: &mut MsInner, t: &Tunables)
        -> Weight
    {
        if mg.is_removing() {
            return Weight::ZERO;
        }
        ms.fragmentation = Some(ms.sm.as_ref()
            .map(|sm| fragmentation(sm.histogram(), sm.shift()))
            .unwrap_or(0));
        ms.max_size = if ms.loaded() {
            ms.largest_allocatable()
        } else {
            ms.max_size.max(ms.largest_unflushed_free())
        };
        if t.segment_weight_enabled {
            let ashift = mg.config.ashift;
            if ms.allocated_space == 0 {
                segment_weight_empty(self.size, ashift)
            } else if ms.loaded() {
                segment_weight_from_range_tree(ms.allocatable.histogram(),
                    ashift)
            } else if let Some(sm) = ms.sm.as_ref() {
                let deferred = [ms.defer[0].histogram(),
                                ms.defer[1].histogram()];
                segment_weight_from_space_map(sm.histogram(), sm.shift(),
                    &deferred[..])
            } else {
                Weight::ZERO
            }
        } else {
            let free = if ms.loaded() {
                ms.allocatable.space()
            } else {
                self.size.saturating_sub(ms.allocated_space + ms.deferspace)
            };
            space_weight(free, ms.fragmentation, self.id,
                mg.config.ms_count(), mg.config.nonrot, t)
        }
    }

    fn recalculate_weight_and_sort(&self, mg: &Group, ms: &mut MsInner,
        t: &Tunables)
    {
        ms.weight = self.calculate_weight(mg, ms, t);
        mg.sort(self.id, ms.activation, ms.weight);
        self.set_hints(ms);
    }

    fn begin_load<'a>(&'a self, ms: MsGuard<'a>)
        -> (MsGuard<'a>, Option<LoadTicket>)
    {
        let mut ms = self.cv.wait_while(ms, |ms| {
            ms.state == LoadState::Loading || ms.phase == SyncPhase::Flushing
        }).unwrap();
        if ms.loaded() {
            return (ms, None);
        }
        assert!(ms.allocatable.is_empty());
        ms.state = LoadState::Loading;
        let ticket = LoadTicket {sm: ms.sm.clone(), length: ms.synced_length};
        (ms, Some(ticket))
    }

    fn read_space_map(&self, mg: &Group, ticket: &LoadTicket, floor: u32)
        -> Result<RangeTree>
    {
        let mut rt = RangeTree::with_size_index(floor);
        match ticket.sm.as_ref() {
            Some(sm) => sm.load(&*mg.ctx.store, &mut rt, MapType::Free,
                                ticket.length)?,
            None => rt.add(self.start, self.size)
        }
        Ok(rt)
    }

    fn finish_load(&self, mg: &Group, ms: &mut MsInner, r: Result<RangeTree>,
        t: &Tunables) -> Result<()>
    {
        let rt = match r {
            Ok(rt) => rt,
            Err(e) => {
                warn!(vdev = mg.vdev, ms = self.id, error = %e,
                      "failed to load metaslab");
                ms.state = LoadState::Unloaded;
                self.set_hints(ms);
                self.cv.notify_all();
                return Err(e);
            }
        };
        ms.allocatable = rt;
        ms.allocatable.remove_tree(&ms.unflushed_allocs);
        ms.allocatable.add_tree(&ms.unflushed_frees);
        if mg.ctx.log.is_some() {
            // Already recorded as unflushed frees, but not yet deferred
            ms.allocatable.remove_tree(&ms.freed);
        }
        for d in ms.defer.iter() {
            ms.allocatable.remove_tree(d);
        }
        ms.state = LoadState::Loaded;
        self.recalculate_weight_and_sort(mg, ms, t);
        if t.debug_verify {
            self.verify_space(ms, mg.ctx.log.is_some());
        }
        debug!(vdev = mg.vdev, ms = self.id,
               segs = ms.allocatable.numsegs(),
               free = ms.allocatable.space(), "loaded metaslab");
        self.cv.notify_all();
        mg.ctx.evict_wanted.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Populate the free space index from the space map.
    ///
    /// Waits for any concurrent load or flush.  The metaslab lock is dropped
    /// while the space map is read.
    fn load<'a>(&'a self, mg: &Group, ms: MsGuard<'a>)
        -> (MsGuard<'a>, Result<()>)
    {
        let t = mg.ctx.tunables.load();
        let (ms, ticket) = self.begin_load(ms);
        let Some(ticket) = ticket else {
            return (ms, Ok(()));
        };
        drop(ms);
        let r = self.read_space_map(mg, &ticket, t.size_index_floor_shift);
        let _sync_guard = self.sync_lock.lock().unwrap();
        let mut ms = self.inner.lock().unwrap();
        let r = self.finish_load(mg, &mut ms, r, &t);
        (ms, r)
    }

    /// Discard the free space index.  The weight falls back to one computed
    /// from the space map.
    fn unload(&self, mg: &Group, ms: &mut MsInner, t: &Tunables) {
        if !ms.loaded() {
            return;
        }
        if ms.activation.is_active() {
            self.passivate(mg, ms, ms.weight);
        }
        ms.allocatable = RangeTree::with_size_index(t.size_index_floor_shift);
        ms.state = LoadState::Unloaded;
        ms.unload_time = Some(mg.ctx.now_ms());
        ms.activation_weight = None;
        debug!(vdev = mg.vdev, ms = self.id, "unloaded metaslab");
        self.recalculate_weight_and_sort(mg, ms, t);
    }

    /// Claim one of the group's slots on behalf of `allocator`.
    ///
    /// Fails with `EBUSY` if somebody else activated this metaslab while we
    /// waited for it to load, `EEXIST` if the slot we want is taken, and
    /// `ENOSPC` if the metaslab has nothing left.
    fn activate<'a>(&'a self, mg: &Group, ms: MsGuard<'a>, allocator: usize,
        activation: Activation) -> (MsGuard<'a>, Result<()>)
    {
        if ms.activation.is_active() {
            return (ms, Ok(()));
        }
        let (mut ms, r) = self.load(mg, ms);
        if r.is_err() {
            return (ms, r);
        }
        if ms.activation.is_active() {
            let r = if ms.allocator != Some(allocator) ||
                ms.activation != activation
            {
                Err(Error::EBUSY)
            } else {
                Ok(())
            };
            return (ms, r);
        }
        if ms.weight.is_zero() {
            return (ms, Err(Error::ENOSPC));
        }
        if activation == Activation::Claim {
            ms.activation_weight = Some(ms.weight);
            ms.activation = activation;
            mg.sort(self.id, activation, ms.weight);
            return (ms, Ok(()));
        }
        if let Err(e) = mg.activate_slot(self.id, allocator, activation,
            ms.weight)
        {
            return (ms, Err(e));
        }
        trace!(vdev = mg.vdev, ms = self.id, allocator, %activation,
               "activated metaslab");
        ms.allocator = Some(allocator);
        ms.activation = activation;
        ms.activation_weight = Some(ms.weight);
        (ms, Ok(()))
    }

    /// Passivate the metaslab if it is active, keeping its weight
    pub(crate) fn deactivate(&self, mg: &Group) {
        let mut ms = self.inner.lock().unwrap();
        if ms.activation.is_active() {
            let weight = ms.weight;
            self.passivate(mg, &mut ms, weight);
            self.set_hints(&ms);
        }
    }

    /// Release our slot and re-rank the metaslab under `weight`
    fn passivate(&self, mg: &Group, ms: &mut MsInner, weight: Weight) {
        assert!(ms.activation.is_active(), "passivating an inactive metaslab");
        let activation = mem::take(&mut ms.activation);
        ms.activation_weight = None;
        ms.weight = weight;
        mg.passivate_slot(self.id, ms.allocator.take(), activation, weight);
        trace!(vdev = mg.vdev, ms = self.id, %weight, "passivated metaslab");
    }

    /// Passivate a segment-weighted metaslab whose best bucket has shrunk too
    /// far since it was activated, so a better one may take its place.
    fn segment_may_passivate(&self, mg: &Group, ms: &mut MsInner,
        t: &Tunables)
    {
        if ms.weight.is_space_based() || mg.ctx.sync_pass() > 1 {
            return;
        }
        let weight = segment_weight_from_range_tree(
            ms.allocatable.histogram(), mg.config.ashift);
        let activation_idx = ms.activation_weight
            .and_then(|w| w.index())
            .unwrap_or(0) as i64;
        let current_idx = weight.index().unwrap_or(0) as i64;
        if current_idx <= activation_idx - i64::from(t.switch_threshold) {
            self.passivate(mg, ms, weight);
        }
    }

    /// Carve `size` bytes out of the free space index
    fn block_alloc(&self, mg: &Group, ms: &mut MsInner, size: u64,
        txg: TxgT, t: &Tunables) -> Option<u64>
    {
        assert!(ms.loaded());
        let mut args = StrategyArgs {
            tree: &mut ms.allocatable,
            cursors: &mut ms.cursors,
            ms_start: self.start,
            ms_size: self.size,
            tunables: t,
        };
        let offset = mg.class.strategy.alloc(&mut args, size);
        if let Some(offset) = offset {
            assert_eq!(p2phase(offset, 1 << mg.config.ashift), 0,
                "misaligned allocation at {offset:#x}");
            ms.allocatable.remove(offset, size);
            ms.trim.clear(offset, size);
            let slot = txg.slot();
            if ms.allocating[slot].is_empty() {
                mg.dirty(self.id, txg);
            }
            ms.allocating[slot].add(offset, size);
            ms.allocating_total += size;
        }
        ms.max_size = ms.largest_allocatable();
        offset
    }

    /// Try to allocate `asize` bytes, activating the metaslab if needed.
    ///
    /// `None` means the caller should try another metaslab.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn try_alloc(&self, mg: &Group, was_active: bool,
        allocator: usize, activation: Activation, asize: u64, txg: TxgT,
        try_hard: bool, t: &Tunables) -> Option<u64>
    {
        let mut ms = self.inner.lock().unwrap();
        if was_active && !ms.activation.is_active() {
            // Passivated while we waited for the lock
            return None;
        }
        if !was_active && ms.activation.has_slot() &&
            (ms.allocator != Some(allocator) || ms.activation != activation)
        {
            // Some other allocator got here first
            return None;
        }
        if ms.activation == Activation::Claim &&
            activation != Activation::Claim
        {
            let weight = ms.weight;
            self.passivate(mg, &mut ms, weight);
            self.set_hints(&ms);
            return None;
        }
        ms.selected_txg = txg;
        ms.selected_time = mg.ctx.now_ms();
        let (mut ms, r) = self.activate(mg, ms, allocator, activation);
        let activated = match r {
            Ok(()) => true,
            Err(Error::EBUSY) | Err(Error::EEXIST) => false,
            Err(_) => {
                self.set_hints(&ms);
                return None;
            }
        };
        let now = mg.ctx.now_ms();
        self.set_hints(&ms);
        if self.should_allocate(ms.weight, asize, try_hard, now, t) {
            if ms.phase == SyncPhase::Condensing || ms.disabled > 0 {
                if activated {
                    let weight = ms.weight;
                    self.passivate(mg, &mut ms, weight);
                }
                self.set_hints(&ms);
                return None;
            }
            if let Some(offset) = self.block_alloc(mg, &mut ms, asize, txg, t)
            {
                if activated {
                    self.segment_may_passivate(mg, &mut ms, t);
                }
                self.set_hints(&ms);
                trace!(vdev = mg.vdev, ms = self.id, offset, size = asize,
                       %txg, "allocated");
                return Some(offset);
            }
        }
        // The metaslab is loaded now, so its weight can be made exact.
        let weight = if ms.weight.is_space_based() {
            Weight::Space(ms.largest_allocatable())
        } else {
            segment_weight_from_range_tree(ms.allocatable.histogram(),
                mg.config.ashift)
        };
        if activated {
            self.passivate(mg, &mut ms, weight);
        } else {
            ms.weight = weight;
            mg.sort(self.id, ms.activation, weight);
        }
        self.set_hints(&ms);
        None
    }

    /// Undo an allocation made earlier in the same open txg
    pub(crate) fn unalloc(&self, offset: u64, size: u64, txg: TxgT)
        -> Result<()>
    {
        let mut ms = self.inner.lock().unwrap();
        let slot = txg.slot();
        if !ms.allocating[slot].contains(offset, size) {
            return Err(Error::ENOENT);
        }
        assert!(ms.phase != SyncPhase::Condensing);
        ms.allocating[slot].remove(offset, size);
        ms.allocating_total -= size;
        if ms.loaded() {
            ms.allocatable.add(offset, size);
            ms.max_size = ms.largest_allocatable();
        }
        self.set_hints(&ms);
        Ok(())
    }

    /// Record a free, to be synced in `txg`.
    ///
    /// With `checkpoint` set the range stays allocated until the checkpoint
    /// is discarded.  Fails with `ENOENT` if any part of the range is already
    /// free, being freed, or deferred.
    pub(crate) fn free(&self, mg: &Group, offset: u64, size: u64, txg: TxgT,
        checkpoint: bool) -> Result<()>
    {
        let mut ms = self.inner.lock().unwrap();
        if Self::already_free(&ms, offset, size) {
            warn!(vdev = mg.vdev, ms = self.id, offset, size, %txg,
                  "freeing free segment");
            return Err(Error::ENOENT);
        }
        mg.dirty(self.id, txg);
        if checkpoint {
            ms.checkpointing.add(offset, size);
        } else {
            ms.freeing[txg.slot()].add(offset, size);
        }
        Ok(())
    }

    /// Could `free` accept this range right now?
    pub(crate) fn freeable(&self, offset: u64, size: u64) -> Result<()> {
        let ms = self.inner.lock().unwrap();
        if Self::already_free(&ms, offset, size) {
            Err(Error::ENOENT)
        } else {
            Ok(())
        }
    }

    /// Turn frees held for a discarded checkpoint into ordinary frees
    pub(crate) fn release_checkpointing(&self, mg: &Group, txg: TxgT) {
        let mut guard = self.inner.lock().unwrap();
        let ms = &mut *guard;
        if ms.checkpointing.is_empty() {
            return;
        }
        mg.dirty(self.id, txg);
        ms.freeing[txg.slot()].add_tree(&ms.checkpointing);
        ms.checkpointing.vacate();
    }

    fn already_free(ms: &MsInner, offset: u64, size: u64) -> bool {
        (ms.loaded() && ms.allocatable.intersects(offset, size))
            || ms.freeing.iter().any(|f| f.intersects(offset, size))
            || ms.freed.intersects(offset, size)
            || ms.checkpointing.intersects(offset, size)
            || ms.defer.iter().any(|d| d.intersects(offset, size))
    }

    /// Mark a range allocated again, as when replaying an intent log.
    ///
    /// With `txg` zero, only check that the range is free.
    pub(crate) fn claim(&self, mg: &Group, offset: u64, size: u64, txg: TxgT)
        -> Result<()>
    {
        let mut ms = self.inner.lock().unwrap();
        if txg != TxgT(0) || !ms.loaded() {
            let (g, r) = self.activate(mg, ms, 0, Activation::Claim);
            ms = g;
            self.set_hints(&ms);
            match r {
                Ok(()) | Err(Error::EBUSY) | Err(Error::ENOSPC) => (),
                Err(e) => return Err(e)
            }
        }
        if !ms.allocatable.contains(offset, size) {
            return Err(Error::ENOENT);
        }
        if txg == TxgT(0) {
            return Ok(());
        }
        assert!(ms.phase != SyncPhase::Condensing);
        assert_eq!(p2phase(offset | size, 1 << mg.config.ashift), 0);
        ms.allocatable.remove(offset, size);
        ms.trim.clear(offset, size);
        let slot = txg.slot();
        if ms.allocating[slot].is_empty() {
            mg.dirty(self.id, txg);
        }
        ms.allocating[slot].add(offset, size);
        ms.allocating_total += size;
        ms.max_size = ms.largest_allocatable();
        self.set_hints(&ms);
        Ok(())
    }

    fn should_condense(&self, mg: &Group, ms: &MsInner, t: &Tunables) -> bool
    {
        let Some(sm) = ms.sm.as_ref() else {
            return false;
        };
        if ms.allocatable.numsegs() == 0 || ms.condense_wanted {
            return true;
        }
        let record_size = t.sm_block_size.max(1 << mg.config.ashift);
        let object_size = sm.length();
        let optimal_size = sm.estimate_optimal_size(&ms.allocatable);
        object_size >= optimal_size * t.condense_pct / 100 &&
            object_size > t.condense_block_threshold * record_size
    }

    /// Ask for the space map to be rewritten at the next opportunity
    pub(crate) fn request_condense(&self, mg: &Group, txg: TxgT) {
        let mut ms = self.inner.lock().unwrap();
        ms.condense_wanted = true;
        self.set_hints(&ms);
        mg.dirty(self.id, txg);
    }

    /// Update bookkeeping after the space map absorbed every unflushed change
    fn flush_update(&self, mg: &Group, ms: &mut MsInner, txg: TxgT) {
        ms.synced_length = ms.sm.as_ref().map(SpaceMap::length).unwrap_or(0);
        if ms.unflushed_txg == TxgT(0) {
            return;
        }
        if let Some(log) = mg.ctx.log.as_ref() {
            log.lock().unwrap().bump(ms.unflushed_txg, txg, mg.vdev, self.id);
            ms.unflushed_txg = txg;
        }
    }

    /// Rewrite the space map from scratch.
    ///
    /// The new map records everything as allocated, then frees the free
    /// space index, then frees whatever is deferred or still being
    /// allocated, since those will be recorded again as they sync.
    fn condense<'a>(&'a self, mg: &Group, mut ms: MsGuard<'a>, txg: TxgT)
        -> Result<MsGuard<'a>>
    {
        let store = &*mg.ctx.store;
        let pass = mg.ctx.sync_pass();
        assert!(ms.loaded());
        debug!(vdev = mg.vdev, ms = self.id, %txg,
               length = ms.sm.as_ref().map(SpaceMap::length),
               segs = ms.allocatable.numsegs(), "condensing");
        ms.condense_wanted = false;
        let mut condense_tree = RangeTree::new();
        for d in ms.defer.iter() {
            condense_tree.add_tree(d);
        }
        for i in 0..TXG_CONCURRENT_STATES {
            condense_tree.add_tree(&ms.allocating[(txg + i).slot()]);
        }
        if let Some(log) = mg.ctx.log.as_ref() {
            log.lock().unwrap().sub_memused(ms.unflushed_mem());
            ms.unflushed_allocs.vacate();
            ms.unflushed_frees.vacate();
        }
        let free = ms.allocatable.iter().collect::<Vec<_>>();
        let Some(mut sm) = ms.sm.clone() else {
            return Ok(ms);
        };
        ms.phase = SyncPhase::Condensing;
        self.set_hints(&ms);
        drop(ms);

        let r = sm.truncate(store)
            .and_then(|_| sm.write(store,
                iter::once((self.start, self.start + self.size)),
                MapType::Alloc, None, txg, pass))
            .and_then(|_| sm.write(store, free, MapType::Free, None, txg,
                pass))
            .and_then(|_| sm.write(store, condense_tree.iter(),
                MapType::Free, None, txg, pass));

        let mut ms = self.inner.lock().unwrap();
        ms.phase = SyncPhase::Idle;
        ms.sm = Some(sm);
        self.set_hints(&ms);
        self.cv.notify_all();
        r?;
        self.flush_update(mg, &mut ms, txg);
        Ok(ms)
    }

    /// Write this txg's allocations and frees to disk.
    pub(crate) fn sync(&self, mg: &Group, txg: TxgT) -> Result<()> {
        let ctx = &mg.ctx;
        let store = &*ctx.store;
        let t = ctx.tunables.load();
        let pass = ctx.sync_pass();
        let slot = txg.slot();

        let _sync_guard = self.sync_lock.lock().unwrap();
        let mut ms = self.inner.lock().unwrap();
        if ms.new {
            return Ok(());
        }
        if ms.allocating[slot].is_empty() && ms.freeing[slot].is_empty() &&
            ms.checkpointing.is_empty() &&
            !(ms.loaded() && ms.condense_wanted)
        {
            return Ok(());
        }
        if ms.sm.is_none() {
            let sm = SpaceMap::create(store, self.start, self.size,
                mg.config.ashift)?;
            mg.record_sm(self.id, sm.object())?;
            ms.sm = Some(sm);
        }
        if let Some(sm) = ms.sm.as_ref() {
            mg.histogram_remove(sm);
        }
        if pass == 1 && ctx.log.is_none() && ms.loaded() &&
            self.should_condense(mg, &ms, &t)
        {
            ms = self.condense(mg, ms, txg)?;
        }

        let Some(mut sm) = ms.sm.clone() else {
            return Ok(());
        };
        let allocs = ms.allocating[slot].iter().collect::<Vec<_>>();
        let alloc_space = ms.allocating[slot].space();
        // Frees that arrive while the lock is dropped wait for the next pass
        let mut freeing = mem::take(&mut ms.freeing[slot]);
        let frees = freeing.iter().collect::<Vec<_>>();
        let free_space = freeing.space();
        drop(ms);
        if let Some(log) = ctx.log.as_ref() {
            let mut log = log.lock().unwrap();
            log.write(store, txg, allocs, MapType::Alloc, mg.vdev, pass)?;
            log.write(store, txg, frees, MapType::Free, mg.vdev, pass)?;
        } else {
            sm.write(store, allocs, MapType::Alloc, None, txg, pass)?;
            sm.write(store, frees, MapType::Free, None, txg, pass)?;
        }
        let mut guard = self.inner.lock().unwrap();
        let ms = &mut *guard;

        if let Some(log) = ctx.log.as_ref() {
            let before = ms.unflushed_mem();
            ms.allocating[slot].remove_xor_add(&mut ms.unflushed_frees,
                &mut ms.unflushed_allocs);
            freeing.remove_xor_add(&mut ms.unflushed_allocs,
                &mut ms.unflushed_frees);
            let after = ms.unflushed_mem();
            let mut log = log.lock().unwrap();
            if ms.unflushed_txg == TxgT(0) {
                log.add_metaslab(txg, mg.vdev, self.id);
                ms.unflushed_txg = txg;
            }
            log.sub_memused(before);
            log.add_memused(after);
        }
        ms.allocated_space = ms.allocated_space + alloc_space - free_space;

        if !ms.checkpointing.is_empty() {
            let segs = ms.checkpointing.iter().collect::<Vec<_>>();
            mg.checkpoint_write(segs, txg, pass)?;
            ms.checkpointing.vacate();
        }

        if ms.loaded() {
            sm.histogram_clear();
            sm.histogram_add(ms.allocatable.histogram());
            sm.histogram_add(ms.freed.histogram());
            for d in ms.defer.iter() {
                sm.histogram_add(d.histogram());
            }
        }
        sm.histogram_add(freeing.histogram());
        sm.sync_phys(store)?;
        mg.histogram_add(&sm);
        ms.sm = Some(sm);

        if pass == 1 {
            assert!(ms.freed.is_empty());
            freeing.swap(&mut ms.freed);
            assert_eq!(ms.allocated_this_txg, 0);
        } else {
            freeing.vacate_into(&mut ms.freed);
        }
        ms.allocated_this_txg += alloc_space;
        ms.allocating[slot].vacate();
        self.set_hints(ms);
        trace!(vdev = mg.vdev, ms = self.id, %txg, pass, alloc = alloc_space,
               free = free_space, "synced metaslab");
        Ok(())
    }

    /// Does this metaslab still have work for the current sync pass?
    pub(crate) fn sync_pending(&self, txg: TxgT) -> bool {
        let ms = self.inner.lock().unwrap();
        !ms.new && (!ms.allocating[txg.slot()].is_empty() ||
            !ms.freeing[txg.slot()].is_empty() ||
            !ms.checkpointing.is_empty())
    }

    /// Fold unflushed log changes into the metaslab's own space map.
    ///
    /// Returns `false` if the metaslab couldn't be flushed right now.
    pub(crate) fn flush(&self, mg: &Group, txg: TxgT) -> Result<bool> {
        let ctx = &mg.ctx;
        let store = &*ctx.store;
        let t = ctx.tunables.load();
        let pass = ctx.sync_pass();

        let _sync_guard = self.sync_lock.lock().unwrap();
        let mut ms = self.inner.lock().unwrap();
        if ms.state == LoadState::Loading || ms.sm.is_none() {
            return Ok(false);
        }
        if ms.loaded() && self.should_condense(mg, &ms, &t) {
            if let Some(sm) = ms.sm.as_ref() {
                mg.histogram_remove(sm);
            }
            let mut guard = self.condense(mg, ms, txg)?;
            let ms = &mut *guard;
            if let Some(sm) = ms.sm.as_mut() {
                sm.histogram_clear();
                sm.histogram_add(ms.allocatable.histogram());
                assert!(ms.freed.is_empty());
                for d in ms.defer.iter() {
                    sm.histogram_add(d.histogram());
                }
                sm.sync_phys(store)?;
                mg.histogram_add(sm);
            }
            self.recalculate_weight_and_sort(mg, ms, &t);
            return Ok(true);
        }

        let allocs = ms.unflushed_allocs.iter().collect::<Vec<_>>();
        let frees = ms.unflushed_frees.iter().collect::<Vec<_>>();
        let Some(mut sm) = ms.sm.clone() else {
            return Ok(false);
        };
        ms.phase = SyncPhase::Flushing;
        self.set_hints(&ms);
        drop(ms);
        let r = sm.write(store, allocs, MapType::Alloc, None, txg, pass)
            .and_then(|_| sm.write(store, frees, MapType::Free, None, txg,
                pass));
        let mut ms = self.inner.lock().unwrap();
        ms.phase = SyncPhase::Idle;
        ms.sm = Some(sm);
        self.set_hints(&ms);
        self.cv.notify_all();
        r?;

        if let Some(log) = ctx.log.as_ref() {
            log.lock().unwrap().sub_memused(ms.unflushed_mem());
        }
        ms.unflushed_allocs.vacate();
        ms.unflushed_frees.vacate();
        if t.debug_verify {
            self.verify_space(&ms, true);
        }
        self.flush_update(mg, &mut ms, txg);
        debug!(vdev = mg.vdev, ms = self.id, %txg, "flushed metaslab");
        Ok(true)
    }

    /// Finish a txg: age the deferred frees, publish space changes, and
    /// re-rank the metaslab.
    pub(crate) fn sync_done(&self, mg: &Group, txg: TxgT) {
        let ctx = &mg.ctx;
        let t = ctx.tunables.load();
        let mut guard = self.inner.lock().unwrap();

        if guard.new {
            mg.space_update(0, 0, self.size as i64);
        }
        let dslot = txg.defer_slot();
        let class_space = mg.class.space();
        let free_space = class_space.saturating_sub(mg.class.alloc());
        let slop = class_space >> t.slop_shift;
        let defer_allowed = free_space > slop && !mg.is_removing();

        let freed = guard.freed.space() as i64;
        let alloc_delta = guard.allocated_this_txg as i64 - freed;
        let defer_delta = if defer_allowed {
            freed - guard.defer[dslot].space() as i64
        } else {
            -(guard.defer[dslot].space() as i64)
        };
        mg.space_update(alloc_delta + defer_delta, defer_delta, 0);

        if ctx.log.is_none() {
            guard = self.cv.wait_while(guard, |ms| {
                ms.state == LoadState::Loading
            }).unwrap();
        }
        let ms = &mut *guard;
        let loaded = ms.loaded();

        if t.autotrim {
            ms.trim.add_tree(&ms.defer[dslot]);
            if !defer_allowed {
                ms.trim.add_tree(&ms.freed);
            }
        } else {
            ms.trim.vacate();
        }
        if loaded {
            ms.defer[dslot].vacate_into(&mut ms.allocatable);
        } else {
            ms.defer[dslot].vacate();
        }
        if defer_allowed {
            ms.freed.swap(&mut ms.defer[dslot]);
        } else if loaded {
            ms.freed.vacate_into(&mut ms.allocatable);
        } else {
            ms.freed.vacate();
        }

        ms.synced_length = ms.sm.as_ref().map(SpaceMap::length).unwrap_or(0);
        ms.deferspace = (ms.deferspace as i64 + defer_delta) as u64;
        assert!(ms.deferspace <= self.size);
        if ms.deferspace != 0 {
            mg.dirty(self.id, txg + 1);
        }
        if ms.new {
            ms.new = false;
            mg.ms_ready.fetch_add(1, Ordering::Relaxed);
        }
        self.recalculate_weight_and_sort(mg, ms, &t);
        assert!(ms.allocating[txg.slot()].is_empty());
        assert!(ms.freeing[txg.slot()].is_empty());
        assert!(ms.freed.is_empty());
        ms.allocating_total -= ms.allocated_this_txg;
        ms.allocated_this_txg = 0;
        if t.debug_verify {
            self.verify_space(ms, ctx.log.is_some());
        }

        if loaded && ms.activation.is_active() && ms.weight.is_space_based() &&
            ms.fragmentation.unwrap_or(0) > t.fragmentation_threshold
        {
            let weight = ms.weight;
            self.passivate(mg, ms, weight);
        }

        let now = ctx.now_ms();
        let busy_later = (1..TXG_CONCURRENT_STATES)
            .any(|i| !ms.allocating[(txg + i).slot()].is_empty());
        if loaded && ms.disabled == 0 && ms.phase == SyncPhase::Idle &&
            ms.selected_txg + t.unload_delay < txg &&
            now > ms.selected_time.saturating_add(t.unload_delay_ms) &&
            !busy_later && !ms.condense_wanted && !t.debug_unload
        {
            self.unload(mg, ms, &t);
        }
        self.set_hints(ms);
    }

    /// Check the conservation of space.  Only meaningful between syncs.
    fn verify_space(&self, ms: &MsInner, logging: bool) {
        if !ms.loaded() {
            return;
        }
        let summary = Self::summarize(ms);
        assert_eq!(summary.total(), self.size,
            "metaslab {} space accounting mismatch: {summary:?}", self.id);
        if !logging {
            if let Some(sm) = ms.sm.as_ref() {
                assert_eq!(sm.allocated(), ms.allocated_space as i64,
                    "metaslab {} space map disagrees with in-core state",
                    self.id);
            }
        }
    }

    fn summarize(ms: &MsInner) -> SpaceSummary {
        SpaceSummary {
            allocated: ms.allocated_space,
            allocatable: ms.allocatable.space(),
            allocating: ms.allocating.iter().map(RangeTree::space).sum(),
            deferred: ms.defer.iter().map(RangeTree::space).sum(),
            freed: ms.freed.space(),
        }
    }

    /// Space accounting by category, if the metaslab is loaded
    pub(crate) fn space_summary(&self) -> Option<SpaceSummary> {
        let ms = self.inner.lock().unwrap();
        ms.loaded().then(|| Self::summarize(&ms))
    }

    /// The free space index, if loaded, as `(start, end)` pairs
    pub(crate) fn free_segments(&self) -> Option<Vec<(u64, u64)>> {
        let ms = self.inner.lock().unwrap();
        ms.loaded().then(|| ms.allocatable.iter().collect())
    }

    pub(crate) fn info(&self) -> MetaslabInfo {
        let ms = self.inner.lock().unwrap();
        MetaslabInfo {
            id: self.id,
            start: self.start,
            size: self.size,
            sm_object: ms.sm.as_ref().map(SpaceMap::object),
            state: ms.state,
            activation: ms.activation,
            weight: ms.weight,
            fragmentation: ms.fragmentation,
            allocated: ms.allocated_space,
            free: ms.loaded().then(|| ms.allocatable.space()),
            deferred: ms.deferspace,
            max_size: ms.max_size,
            disabled: ms.disabled > 0,
        }
    }

    pub(crate) fn fragmentation(&self) -> Option<u64> {
        self.inner.lock().unwrap().fragmentation
    }

    /// Load the metaslab on behalf of the preloader
    pub(crate) fn preload(&self, mg: &Group) {
        let ms = self.inner.lock().unwrap();
        let (mut ms, r) = self.load(mg, ms);
        if let Err(e) = r {
            warn!(vdev = mg.vdev, ms = self.id, error = %e, "preload failed");
        }
        ms.selected_txg = mg.ctx.syncing_txg();
        ms.selected_time = mg.ctx.now_ms();
        self.set_hints(&ms);
    }

    /// Load the metaslab, if it isn't already
    pub(crate) fn force_load(&self, mg: &Group) -> Result<()> {
        let ms = self.inner.lock().unwrap();
        let (ms, r) = self.load(mg, ms);
        self.set_hints(&ms);
        r
    }

    /// Unload the metaslab unless something needs it loaded.
    pub(crate) fn force_unload(&self, mg: &Group) -> Result<()> {
        let t = mg.ctx.tunables.load();
        let mut ms = self.inner.lock().unwrap();
        if ms.disabled > 0 || ms.phase != SyncPhase::Idle ||
            ms.allocating_total > 0
        {
            return Err(Error::EBUSY);
        }
        self.unload(mg, &mut ms, &t);
        Ok(())
    }

    /// Memory used by the free space index and the last time the metaslab
    /// was selected, if it is loaded.  Skips metaslabs that are busy.
    pub(crate) fn loaded_mem(&self) -> Option<(u64, u64)> {
        let ms = self.inner.try_lock().ok()?;
        ms.loaded().then(|| (ms.allocatable.mem_used(), ms.selected_time))
    }

    /// Unload the metaslab to reclaim memory, if nobody is using it.
    ///
    /// Returns the memory reclaimed.
    pub(crate) fn try_evict(&self, mg: &Group) -> u64 {
        let t = mg.ctx.tunables.load();
        let Ok(mut ms) = self.inner.try_lock() else {
            return 0;
        };
        if !ms.loaded() || ms.activation.is_active() || ms.sm.is_none() ||
            ms.allocating_total > 0 || ms.phase != SyncPhase::Idle ||
            ms.disabled > 0 || t.debug_unload
        {
            return 0;
        }
        let mem = ms.allocatable.mem_used();
        debug!(vdev = mg.vdev, ms = self.id, mem, "evicting metaslab");
        self.unload(mg, &mut ms, &t);
        mem
    }

    /// Quiesce the metaslab for maintenance.  Blocks while too many of the
    /// group's metaslabs are already disabled.
    pub(crate) fn disable(&self, mg: &Group) {
        let t = mg.ctx.tunables.load();
        let mut d = mg.disabled.lock().unwrap();
        d = mg.disabled_cv.wait_while(d, |d| d.updating).unwrap();
        d.updating = true;
        let already = self.inner.lock().unwrap().disabled > 0;
        if !already {
            d = mg.disabled_cv.wait_while(d, |d| {
                d.count >= t.max_disabled_per_group
            }).unwrap();
            d.count += 1;
        }
        {
            let mut ms = self.inner.lock().unwrap();
            ms.disabled += 1;
            self.set_hints(&ms);
        }
        d.updating = false;
        mg.disabled_cv.notify_all();
    }

    /// Undo one [`Metaslab::disable`], optionally unloading the metaslab if
    /// that was the last one.
    pub(crate) fn enable(&self, mg: &Group, unload: bool) {
        let t = mg.ctx.tunables.load();
        let mut d = mg.disabled.lock().unwrap();
        let mut ms = self.inner.lock().unwrap();
        assert!(ms.disabled > 0, "enabling a metaslab that isn't disabled");
        ms.disabled -= 1;
        if ms.disabled == 0 {
            d.count -= 1;
            mg.disabled_cv.notify_all();
            if unload {
                self.unload(mg, &mut ms, &t);
            }
        }
        self.set_hints(&ms);
    }

    /// Hand over the accumulated trim ranges
    pub(crate) fn take_trim(&self) -> RangeTree {
        mem::take(&mut self.inner.lock().unwrap().trim)
    }

    pub(crate) fn unflushed_txg(&self) -> TxgT {
        self.inner.lock().unwrap().unflushed_txg
    }

    pub(crate) fn set_unflushed_txg(&self, txg: TxgT) {
        self.inner.lock().unwrap().unflushed_txg = txg;
    }

    /// Apply one entry of the pool-wide log while opening the pool
    pub(crate) fn replay(&self, kind: MapType, offset: u64, size: u64) {
        let mut guard = self.inner.lock().unwrap();
        let ms = &mut *guard;
        let end = offset + size;
        match kind {
            MapType::Alloc => RangeTree::remove_xor_add_segment(offset, end,
                &mut ms.unflushed_frees, &mut ms.unflushed_allocs),
            MapType::Free => RangeTree::remove_xor_add_segment(offset, end,
                &mut ms.unflushed_allocs, &mut ms.unflushed_frees),
        }
    }

    /// Publish the net effect of replayed log entries.  Returns the memory
    /// used by the unflushed trees.
    pub(crate) fn replay_done(&self, mg: &Group) -> u64 {
        let t = mg.ctx.tunables.load();
        let mut guard = self.inner.lock().unwrap();
        let ms = &mut *guard;
        let delta = ms.unflushed_allocs.space() as i64 -
            ms.unflushed_frees.space() as i64;
        ms.allocated_space = (ms.allocated_space as i64 + delta) as u64;
        mg.space_update(delta, 0, 0);
        self.recalculate_weight_and_sort(mg, ms, &t);
        ms.unflushed_mem()
    }

    /// Can the device holding this metaslab be removed?
    pub(crate) fn is_vacant(&self) -> bool {
        let ms = self.inner.lock().unwrap();
        ms.allocated_space == 0 && ms.allocating_total == 0 &&
            ms.freeing.iter().all(RangeTree::is_empty) &&
            ms.checkpointing.is_empty() && ms.unflushed_allocs.is_empty()
    }

    /// Tear down the metaslab as its device is removed
    pub(crate) fn fini(&self, mg: &Group) -> Result<()> {
        let mut ms = self.inner.lock().unwrap();
        if let Some(sm) = ms.sm.as_ref() {
            mg.histogram_remove(sm);
        }
        if !ms.new {
            mg.space_update(-((ms.allocated_space + ms.deferspace) as i64),
                -(ms.deferspace as i64), -(self.size as i64));
        }
        if let Some(log) = mg.ctx.log.as_ref() {
            let mut log = log.lock().unwrap();
            log.sub_memused(ms.unflushed_mem());
            if ms.unflushed_txg != TxgT(0) {
                log.remove_metaslab(ms.unflushed_txg, mg.vdev, self.id);
            }
        }
        ms.state = LoadState::Unloaded;
        ms.allocatable.vacate();
        match ms.sm.take() {
            Some(sm) => sm.destroy(&*mg.ctx.store),
            None => Ok(())
        }
    }
}

// LCOV_EXCL_STOP
