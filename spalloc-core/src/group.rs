// vim: tw=80
//! Metaslab groups: all of the metaslabs of one top-level device

use byteorder::{ByteOrder, LittleEndian};
use fixedbitset::FixedBitSet;
use serde_derive::{Deserialize, Serialize};
use std::{
    cmp,
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    mem,
    sync::{
        Arc,
        Condvar,
        Mutex,
        RwLock,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
};
use tracing::{debug, trace};
use crate::{
    class::ClassAccounting,
    metaslab::{Metaslab, MetaslabInfo},
    pool::PoolCtx,
    space_map::{MapType, SmEntry, SpaceMap},
    throttle::GroupThrottle,
    tunables::Tunables,
    types::*,
    vdev::{Health, VdevConfig},
    weight::*,
};

/// Size of one entry in the metaslab array object
const MS_ARRAY_ENTRY: u64 = 8;

/// Everything the label records about one device
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct VdevLabel {
    pub id: VdevT,
    pub config: VdevConfig,
    pub health: Health,
    /// Object holding each metaslab's space map object number
    pub ms_array: ObjectT,
    pub checkpoint_sm: Option<ObjectT>,
    /// Each metaslab's unflushed txg.  Empty unless the pool-wide log is in
    /// use.
    pub unflushed_txgs: Vec<TxgT>,
}

/// How many of a group's metaslabs are disabled
#[derive(Debug, Default)]
pub(crate) struct DisabledCount {
    pub count: u64,
    /// Some thread is in the middle of disabling a metaslab
    pub updating: bool,
}

#[derive(Debug)]
struct GroupInner {
    /// Every metaslab, best first
    ranking: BTreeSet<RankKey>,
    /// Each metaslab's current position in `ranking`, by id
    keys: Vec<RankKey>,
    /// Each allocator's active primary metaslab
    primaries: Vec<Option<u64>>,
    secondaries: Vec<Option<u64>>,
    /// Free segments of every metaslab with a space map, by size class
    histogram: [u64; RANGE_TREE_HISTOGRAM_SIZE],
    /// Should allocations consider this group?
    allocatable: bool,
    /// Does this group have any space yet?
    initialized: bool,
    /// Free space, as a percentage
    free_capacity: u64,
    fragmentation: Option<u64>,
}

impl GroupInner {
    fn resort(&mut self, key: RankKey) {
        let id = key.id as usize;
        let old = mem::replace(&mut self.keys[id], key);
        self.ranking.remove(&old);
        self.ranking.insert(key);
    }
}

/// Point-in-time statistics for one group
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupStats {
    pub vdev: VdevT,
    pub health: Health,
    pub space: u64,
    pub alloc: u64,
    pub deferred: u64,
    pub fragmentation: Option<u64>,
    pub allocatable: bool,
    pub allocations: u64,
    pub failed_allocations: u64,
}

#[derive(Debug)]
pub struct Group {
    pub(crate) ctx: Arc<PoolCtx>,
    pub(crate) class: Arc<ClassAccounting>,
    pub(crate) vdev: VdevT,
    pub(crate) config: VdevConfig,
    metaslabs: Vec<Arc<Metaslab>>,
    ms_array: ObjectT,
    inner: Mutex<GroupInner>,
    space: AtomicU64,
    alloc: AtomicU64,
    deferred: AtomicU64,
    /// Adjustment to the aliquot, favoring emptier devices
    pub(crate) bias: AtomicI64,
    pub(crate) throttle: GroupThrottle,
    health: RwLock<Health>,
    removing: AtomicBool,
    activated: AtomicBool,
    /// Even the smallest allocation recently failed
    no_free_space: AtomicBool,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    /// Metaslabs that have synced at least once
    pub(crate) ms_ready: AtomicU64,
    pub(crate) disabled: Mutex<DisabledCount>,
    pub(crate) disabled_cv: Condvar,
    /// Metaslabs with changes to sync, by txg
    dirty: Mutex<[FixedBitSet; TXG_SIZE]>,
    /// Frees that the pool checkpoint still references
    checkpoint_sm: Mutex<Option<SpaceMap>>,
}

impl Group {
    #[allow(clippy::too_many_arguments)]
    fn build(ctx: Arc<PoolCtx>, class: Arc<ClassAccounting>, vdev: VdevT,
        config: VdevConfig, health: Health, ms_array: ObjectT,
        sm_objects: Vec<Option<ObjectT>>, checkpoint_sm: Option<SpaceMap>,
        txg: TxgT) -> Result<Arc<Self>>
    {
        let t = ctx.tunables.load();
        let ms_count = config.ms_count() as usize;
        let allocators = ctx.allocators;
        let keys = (0..ms_count as u64)
            .map(|id| RankKey::new(Activation::Inactive, Weight::ZERO,
                                   id << config.ms_shift, id))
            .collect::<Vec<_>>();
        let inner = GroupInner {
            ranking: keys.iter().copied().collect(),
            keys,
            primaries: vec![None; allocators],
            secondaries: vec![None; allocators],
            histogram: [0; RANGE_TREE_HISTOGRAM_SIZE],
            allocatable: false,
            initialized: false,
            free_capacity: 0,
            fragmentation: None,
        };
        let dirty = [(); TXG_SIZE].map(|_| FixedBitSet::with_capacity(ms_count));
        let mut mg = Group {
            ctx,
            class,
            vdev,
            config,
            metaslabs: Vec::new(),
            ms_array,
            inner: Mutex::new(inner),
            space: AtomicU64::new(0),
            alloc: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            bias: AtomicI64::new(0),
            throttle: GroupThrottle::new(allocators,
                t.alloc_initial_queue_depth, t.alloc_max_queue_depth),
            health: RwLock::new(health),
            removing: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            no_free_space: AtomicBool::new(false),
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            ms_ready: AtomicU64::new(0),
            disabled: Mutex::new(DisabledCount::default()),
            disabled_cv: Condvar::new(),
            dirty: Mutex::new(dirty),
            checkpoint_sm: Mutex::new(checkpoint_sm),
        };
        let metaslabs = sm_objects.into_iter()
            .enumerate()
            .map(|(id, obj)| Metaslab::new(&mg, id as u64, obj).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        mg.metaslabs = metaslabs;
        for ms in mg.metaslabs.iter() {
            ms.init(&mg, txg);
        }
        Ok(Arc::new(mg))
    }

    /// Create the group for a new device.  Its space becomes available once
    /// `txg` syncs, or immediately for a brand new pool.
    pub(crate) fn create(ctx: Arc<PoolCtx>, class: Arc<ClassAccounting>,
        vdev: VdevT, config: VdevConfig, txg: TxgT) -> Result<Arc<Self>>
    {
        config.validate()?;
        let ms_array = ctx.store.create()?;
        let sm_objects = vec![None; config.ms_count() as usize];
        debug!(vdev, ms_count = config.ms_count(), ms_shift = config.ms_shift,
               %txg, "creating metaslab group");
        Self::build(ctx, class, vdev, config, Health::Online, ms_array,
                    sm_objects, None, txg)
    }

    /// Open the group of an existing device
    pub(crate) fn open(ctx: Arc<PoolCtx>, class: Arc<ClassAccounting>,
        label: &VdevLabel) -> Result<Arc<Self>>
    {
        label.config.validate()?;
        let store = &*ctx.store;
        let ms_count = label.config.ms_count() as usize;
        let len = store.len(label.ms_array)?;
        let mut buf = vec![0u8; len as usize];
        store.read(label.ms_array, 0, &mut buf[..])?;
        let mut sm_objects = buf.chunks_exact(MS_ARRAY_ENTRY as usize)
            .map(LittleEndian::read_u64)
            .map(|o| (o != 0).then_some(o))
            .collect::<Vec<_>>();
        sm_objects.resize(ms_count, None);
        let checkpoint_sm = label.checkpoint_sm.map(|o| {
            SpaceMap::open(store, o, 0, label.config.asize,
                           label.config.ashift)
        }).transpose()?;
        let mg = Self::build(ctx, class, label.id, label.config, label.health,
            label.ms_array, sm_objects, checkpoint_sm, TxgT(0))?;
        for (ms, &txg) in mg.metaslabs.iter().zip(label.unflushed_txgs.iter())
        {
            ms.set_unflushed_txg(txg);
        }
        Ok(mg)
    }

    pub(crate) fn label(&self) -> VdevLabel {
        let unflushed_txgs = if self.ctx.log.is_some() {
            self.metaslabs.iter().map(|ms| ms.unflushed_txg()).collect()
        } else {
            Vec::new()
        };
        VdevLabel {
            id: self.vdev,
            config: self.config,
            health: self.health(),
            ms_array: self.ms_array,
            checkpoint_sm: self.checkpoint_sm.lock().unwrap().as_ref()
                .map(SpaceMap::object),
            unflushed_txgs,
        }
    }

    pub fn vdev(&self) -> VdevT {
        self.vdev
    }

    pub fn config(&self) -> &VdevConfig {
        &self.config
    }

    pub(crate) fn metaslab(&self, id: u64) -> &Arc<Metaslab> {
        &self.metaslabs[id as usize]
    }

    pub(crate) fn metaslabs(&self) -> &[Arc<Metaslab>] {
        &self.metaslabs[..]
    }

    /// The metaslab holding `offset`
    pub(crate) fn metaslab_at(&self, offset: u64) -> Result<&Arc<Metaslab>> {
        self.metaslabs.get((offset >> self.config.ms_shift) as usize)
            .ok_or(Error::ENXIO)
    }

    pub fn space(&self) -> u64 {
        self.space.load(Ordering::Relaxed)
    }

    pub fn alloc(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed)
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> Health {
        *self.health.read().unwrap()
    }

    pub(crate) fn set_health(&self, health: Health) {
        *self.health.write().unwrap() = health;
    }

    pub(crate) fn is_removing(&self) -> bool {
        self.removing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_removing(&self, removing: bool) {
        self.removing.store(removing, Ordering::Relaxed);
    }

    pub(crate) fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Relaxed)
    }

    pub(crate) fn set_activated(&self, activated: bool) {
        self.activated.store(activated, Ordering::Relaxed);
    }

    pub(crate) fn is_allocatable(&self) -> bool {
        self.inner.lock().unwrap().allocatable
    }

    pub(crate) fn no_free_space(&self) -> bool {
        self.no_free_space.load(Ordering::Relaxed)
    }

    pub fn fragmentation(&self) -> Option<u64> {
        self.inner.lock().unwrap().fragmentation
    }

    pub fn histogram(&self) -> [u64; RANGE_TREE_HISTOGRAM_SIZE] {
        self.inner.lock().unwrap().histogram
    }

    pub fn stats(&self) -> GroupStats {
        let inner = self.inner.lock().unwrap();
        GroupStats {
            vdev: self.vdev,
            health: self.health(),
            space: self.space(),
            alloc: self.alloc(),
            deferred: self.deferred(),
            fragmentation: inner.fragmentation,
            allocatable: inner.allocatable,
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
        }
    }

    /// Apply space deltas to the group and its class
    pub(crate) fn space_update(&self, alloc: i64, defer: i64, space: i64) {
        fn apply(a: &AtomicU64, delta: i64) {
            if delta >= 0 {
                a.fetch_add(delta as u64, Ordering::Relaxed);
            } else {
                a.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
            }
        }
        apply(&self.alloc, alloc);
        apply(&self.deferred, defer);
        apply(&self.space, space);
        self.class.space_update(alloc, defer, space);
    }

    pub(crate) fn sort(&self, id: u64, activation: Activation, weight: Weight)
    {
        let key = RankKey::new(activation, weight, id << self.config.ms_shift,
                               id);
        self.inner.lock().unwrap().resort(key);
    }

    /// Install a metaslab in one of `allocator`'s slots.  `EEXIST` if the slot
    /// is taken.
    pub(crate) fn activate_slot(&self, id: u64, allocator: usize,
        activation: Activation, weight: Weight) -> Result<()>
    {
        let mut inner = self.inner.lock().unwrap();
        let slot = match activation {
            Activation::Primary => &mut inner.primaries[allocator],
            Activation::Secondary => &mut inner.secondaries[allocator],
            _ => return Err(Error::EINVAL)
        };
        if slot.is_some() {
            return Err(Error::EEXIST);
        }
        *slot = Some(id);
        let key = RankKey::new(activation, weight,
                               id << self.config.ms_shift, id);
        inner.resort(key);
        Ok(())
    }

    /// Vacate a metaslab's slot, if it has one, and re-rank it
    pub(crate) fn passivate_slot(&self, id: u64, allocator: Option<usize>,
        activation: Activation, weight: Weight)
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(allocator) = allocator {
            let slot = match activation {
                Activation::Primary => Some(&mut inner.primaries[allocator]),
                Activation::Secondary =>
                    Some(&mut inner.secondaries[allocator]),
                _ => None
            };
            if let Some(slot) = slot {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        let key = RankKey::new(Activation::Inactive, weight,
                               id << self.config.ms_shift, id);
        inner.resort(key);
    }

    /// Add a space map's histogram into the group's and the class's
    pub(crate) fn histogram_add(&self, sm: &SpaceMap) {
        self.histogram_apply(sm, true);
    }

    pub(crate) fn histogram_remove(&self, sm: &SpaceMap) {
        self.histogram_apply(sm, false);
    }

    fn histogram_apply(&self, sm: &SpaceMap, add: bool) {
        let shift = sm.shift() as usize;
        let mut inner = self.inner.lock().unwrap();
        let mut class_hist = self.class.histogram.lock().unwrap();
        for (i, &count) in sm.histogram().iter().enumerate() {
            let idx = i + shift;
            if idx >= RANGE_TREE_HISTOGRAM_SIZE || count == 0 {
                continue;
            }
            if add {
                inner.histogram[idx] += count;
                class_hist[idx] += count;
            } else {
                assert!(inner.histogram[idx] >= count,
                    "group histogram underflow");
                inner.histogram[idx] -= count;
                class_hist[idx] = class_hist[idx].saturating_sub(count);
            }
        }
    }

    /// Note that metaslab `id` has changes to sync in `txg`
    pub(crate) fn dirty(&self, id: u64, txg: TxgT) {
        self.dirty.lock().unwrap()[txg.slot()].insert(id as usize);
    }

    pub(crate) fn dirty_ids(&self, txg: TxgT) -> Vec<u64> {
        self.dirty.lock().unwrap()[txg.slot()].ones()
            .map(|i| i as u64)
            .collect()
    }

    /// Like `dirty_ids`, but forget them
    pub(crate) fn take_dirty(&self, txg: TxgT) -> Vec<u64> {
        let mut dirty = self.dirty.lock().unwrap();
        let ids = dirty[txg.slot()].ones().map(|i| i as u64).collect();
        dirty[txg.slot()].clear();
        ids
    }

    /// Record a metaslab's space map object in the metaslab array
    pub(crate) fn record_sm(&self, id: u64, object: ObjectT) -> Result<()> {
        let mut buf = [0u8; MS_ARRAY_ENTRY as usize];
        LittleEndian::write_u64(&mut buf[..], object);
        self.ctx.store.write(self.ms_array, id * MS_ARRAY_ENTRY, &buf[..])
    }

    /// Persist frees that the checkpoint still references
    pub(crate) fn checkpoint_write(&self, segs: Vec<(u64, u64)>, txg: TxgT,
        pass: u32) -> Result<()>
    {
        let store = &*self.ctx.store;
        let mut guard = self.checkpoint_sm.lock().unwrap();
        if guard.is_none() {
            *guard = Some(SpaceMap::create(store, 0, self.config.asize,
                                           self.config.ashift)?);
        }
        match guard.as_mut() {
            Some(sm) => sm.write(store, segs, MapType::Free, None, txg, pass),
            None => Ok(())
        }
    }

    /// Return everything the checkpoint held onto to circulation.  The
    /// ranges are freed in `txg`.
    pub(crate) fn discard_checkpoint(&self, txg: TxgT) -> Result<()> {
        let store = &*self.ctx.store;
        for ms in self.metaslabs.iter() {
            ms.release_checkpointing(self, txg);
        }
        let Some(sm) = self.checkpoint_sm.lock().unwrap().take() else {
            return Ok(());
        };
        let mut frees = Vec::new();
        sm.iterate(store, sm.length(), |entry| {
            if let SmEntry::Range{offset, run, ..} = entry {
                frees.push((offset, run));
            }
            Ok(())
        })?;
        debug!(vdev = self.vdev, segs = frees.len(), "discarding checkpoint");
        for (offset, size) in frees {
            self.metaslab_at(offset)?.free(self, offset, size, txg, false)?;
        }
        sm.destroy(store)
    }

    /// Distance between a metaslab and an existing copy of the same block
    fn distance(&self, ms: &Metaslab, dva: &Dva) -> u64 {
        if dva.vdev != self.vdev {
            return 1 << 63;
        }
        let other = dva.offset >> self.config.ms_shift;
        ms.id().abs_diff(other) << self.config.ms_shift
    }

    /// Search the ranking for the next metaslab worth trying, after `search`
    #[allow(clippy::too_many_arguments)]
    fn find_valid(&self, inner: &GroupInner, search: &mut RankKey,
        activation: Activation, dvas: &[Dva], want_unique: bool,
        min_distance: u64, asize: u64, try_hard: bool, t: &Tunables)
        -> Option<(u64, bool)>
    {
        let now = self.ctx.now_ms();
        let mut tries = 0;
        for key in inner.ranking.range(*search..) {
            if !try_hard && tries > t.find_max_tries {
                trace!(vdev = self.vdev, tries, "too many tries");
                return None;
            }
            tries += 1;
            let ms = &self.metaslabs[key.id as usize];
            if !ms.should_allocate(key.weight, asize, try_hard, now, t) {
                continue;
            }
            if ms.is_unavailable() {
                continue;
            }
            let was_active = key.is_slotted();
            let usable = activation == Activation::Primary || was_active ||
                !want_unique || {
                    let target = min_distance + if ms.has_allocations() {
                        0
                    } else {
                        min_distance >> 1
                    };
                    dvas.iter().all(|dva| self.distance(ms, dva) >= target)
                };
            if usable {
                *search = key.successor();
                return Some((key.id, was_active));
            }
        }
        None
    }

    /// Allocate from the best metaslab that will have us.
    #[allow(clippy::too_many_arguments)]
    fn alloc_normal(&self, allocator: usize, asize: u64, txg: TxgT,
        want_unique: bool, dvas: &[Dva], min_distance: u64, try_hard: bool)
        -> Option<u64>
    {
        let t = self.ctx.tunables.load();
        let mut activation = Activation::Primary;
        for dva in dvas.iter().filter(|dva| dva.vdev == self.vdev) {
            if activation == Activation::Primary {
                activation = Activation::Secondary;
            } else {
                activation = Activation::Claim;
                break;
            }
        }
        // Until enough metaslabs are ready to fill every allocator's slots,
        // everybody shares the first allocator's.
        let allocator = if self.ms_ready.load(Ordering::Relaxed) <
            3 * self.ctx.allocators as u64
        {
            0
        } else {
            allocator
        };
        let mut search = RankKey::new(Activation::Inactive,
            Weight::Space(u64::MAX), 0, 0);
        loop {
            let candidate = {
                let inner = self.inner.lock().unwrap();
                let slotted = match activation {
                    Activation::Primary => inner.primaries[allocator],
                    Activation::Secondary => inner.secondaries[allocator],
                    _ => None
                };
                match slotted {
                    Some(id) => Some((id, true)),
                    None => self.find_valid(&inner, &mut search, activation,
                        dvas, want_unique, min_distance, asize, try_hard, &t)
                }
            };
            let (id, was_active) = candidate?;
            let ms = &self.metaslabs[id as usize];
            if let Some(offset) = ms.try_alloc(self, was_active, allocator,
                activation, asize, txg, try_hard, &t)
            {
                return Some(offset);
            }
        }
    }

    /// Allocate `asize` bytes from some metaslab, keeping statistics
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn alloc_dva(&self, allocator: usize, asize: u64, txg: TxgT,
        want_unique: bool, dvas: &[Dva], min_distance: u64, try_hard: bool)
        -> Option<u64>
    {
        let offset = self.alloc_normal(allocator, asize, txg, want_unique,
            dvas, min_distance, try_hard);
        if offset.is_none() {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            if asize == SPA_MINBLOCKSIZE {
                // Not even a gang block fits.  Steer the throttle elsewhere.
                self.no_free_space.store(true, Ordering::Relaxed);
            }
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        offset
    }

    /// Mean fragmentation of the member metaslabs, unless too few of them
    /// have a meaningful value.
    fn compute_fragmentation(&self) -> Option<u64> {
        let (valid, total) = self.metaslabs.iter()
            .filter_map(|ms| ms.fragmentation())
            .fold((0u64, 0u64), |(n, sum), f| (n + 1, sum + f));
        if valid == 0 || valid < (self.metaslabs.len() as u64 + 1) / 2 {
            None
        } else {
            Some(total / valid)
        }
    }

    /// Reevaluate whether allocations should consider this group, and
    /// update the class's counts to match.
    pub(crate) fn alloc_update(&self) {
        let t = self.ctx.tunables.load();
        let space = self.space();
        let alloc = self.alloc();
        let activated = self.is_activated();
        let mut inner = self.inner.lock().unwrap();
        let was_allocatable = inner.allocatable;
        let was_initialized = inner.initialized;
        inner.free_capacity = space.saturating_sub(alloc) * 100 / (space + 1);
        inner.initialized = activated && space != 0;
        if inner.initialized != was_initialized {
            self.class.groups_changed(inner.initialized);
        }
        if inner.initialized {
            self.no_free_space.store(false, Ordering::Relaxed);
        }
        inner.allocatable = activated &&
            inner.free_capacity > t.group_noalloc_threshold &&
            inner.fragmentation
                .map_or(true, |f| f <= t.group_fragmentation_threshold);
        if inner.allocatable != was_allocatable {
            self.class.alloc_groups_changed(inner.allocatable);
        }
    }

    /// Queue the best few metaslabs for loading in the background
    pub(crate) fn preload(self: &Arc<Self>) {
        let t = self.ctx.tunables.load();
        if !t.preload_enabled || !self.is_activated() {
            return;
        }
        let ids = {
            let inner = self.inner.lock().unwrap();
            inner.ranking.iter()
                .enumerate()
                .filter(|&(i, key)| i < t.preload_limit ||
                    self.metaslabs[key.id as usize].condense_wanted())
                .map(|(_, key)| key.id)
                .collect::<Vec<_>>()
        };
        for id in ids {
            let mg = self.clone();
            self.ctx.taskq.dispatch(move || {
                mg.metaslabs[id as usize].preload(&mg);
            });
        }
    }

    /// End-of-txg housekeeping
    pub(crate) fn reassess(self: &Arc<Self>) {
        self.alloc_update();
        let frag = self.compute_fragmentation();
        self.inner.lock().unwrap().fragmentation = frag;
        self.preload();
    }

    /// Passivate every active metaslab, as when the group leaves its class
    pub(crate) fn passivate_all(&self) {
        let ids = {
            let inner = self.inner.lock().unwrap();
            inner.primaries.iter()
                .chain(inner.secondaries.iter())
                .flatten()
                .copied()
                .collect::<Vec<_>>()
        };
        for id in ids {
            self.metaslabs[id as usize].deactivate(self);
        }
    }

    pub(crate) fn infos(&self) -> Vec<MetaslabInfo> {
        self.metaslabs.iter().map(|ms| ms.info()).collect()
    }

    /// Tear down every metaslab and destroy the group's objects
    pub(crate) fn destroy(&self) -> Result<()> {
        for ms in self.metaslabs.iter() {
            ms.fini(self)?;
        }
        if let Some(sm) = self.checkpoint_sm.lock().unwrap().take() {
            sm.destroy(&*self.ctx.store)?;
        }
        self.ctx.store.destroy(self.ms_array)
    }
}

impl Display for Group {
    /// Print one line per metaslab
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let stats = self.stats();
        let infos = self.infos();
        let frag = stats.fragmentation
            .map(|f| format!("{f}%"))
            .unwrap_or_else(|| "-".to_owned());
        writeln!(f, "vdev {}: {} {}, {} metaslabs of {:#x} bytes, \
                 {} allocated, {} deferred, {} fragmented",
                 self.vdev, self.config.class, stats.health, infos.len(),
                 self.config.ms_size(), stats.alloc, stats.deferred, frag)?;
        let id_width = cmp::max(2, format!("{}", infos.len()).len());
        let offset_width = cmp::max(6,
            format!("{:x}", self.config.ms_size() * infos.len() as u64).len());
        let sm_width = cmp::max(8, infos.iter()
            .filter_map(|i| i.sm_object)
            .map(|o| format!("{o}").len())
            .max()
            .unwrap_or(0));
        let free_width = cmp::max(4, format!("{}", self.config.ms_size()).len());
        let weight_width = cmp::max(6, infos.iter()
            .map(|i| format!("{}", i.weight).len())
            .max()
            .unwrap_or(0));
        writeln!(f, "{0:^1$}|{2:^3$}|{4:^5$}|{6:^7$}|{8:^6}|{9:^10$}|{11:^10}",
                 "id", id_width, "offset", offset_width, "spacemap", sm_width,
                 "free", free_width, "frag", "weight", weight_width, "state")?;
        writeln!(f, "{0:-^1$}|{2:-^3$}|{4:-^5$}|{6:-^7$}|{8:-^6}|{9:-^10$}|\
                 {11:-^10}",
                 "", id_width, "", offset_width, "", sm_width, "", free_width,
                 "", "", weight_width, "")?;
        for i in infos {
            let sm = i.sm_object
                .map(|o| format!("{o}"))
                .unwrap_or_else(|| "-".to_owned());
            let free = i.free
                .unwrap_or_else(|| i.size.saturating_sub(i.allocated + i.deferred));
            let frag = i.fragmentation
                .map(|f| format!("{f}%"))
                .unwrap_or_else(|| "-".to_owned());
            let state = format!("{} {}{}", i.state, i.activation,
                                if i.disabled { " D" } else { "" });
            writeln!(f, "{0:>1$}|{2:>3$x}|{4:>5$}|{6:>7$}|{8:>6}|{9:>10$}|{11}",
                     i.id, id_width, i.start, offset_width, sm, sm_width,
                     free, free_width, frag, i.weight.to_string(), weight_width,
                     state)?;
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
