// vim: tw=80
//! The pool: every allocation class, and the per-txg sync driver

use serde_derive::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Instant,
};
use tracing::{debug, info, warn};
use crate::{
    allocator::StrategyKind,
    class::{Class, ClassStats},
    group::{Group, VdevLabel},
    label::*,
    log_sm::PoolLog,
    metaslab::{Metaslab, MetaslabInfo, SpaceSummary},
    object_store::ObjectStore,
    taskq::Taskq,
    tunables::{Tunables, TunablesHandle},
    types::*,
    util::p2phase,
    vdev::{ClassKind, Health, VdevConfig},
};

/// Every allocation class, in a fixed order
const CLASSES: [ClassKind; 3] =
    [ClassKind::Normal, ClassKind::Special, ClassKind::Log];

/// State shared by every group and metaslab of one pool
pub(crate) struct PoolCtx {
    pub tunables: Arc<TunablesHandle>,
    pub store: Arc<dyn ObjectStore>,
    syncing_txg: AtomicU64,
    sync_pass: AtomicU32,
    /// Zero if there is no checkpoint
    checkpoint_txg: AtomicU64,
    /// Pool-wide log space maps, if enabled
    pub log: Option<Mutex<PoolLog>>,
    epoch: Instant,
    /// Number of independent allocation streams
    pub allocators: usize,
    pub taskq: Taskq,
    /// Some metaslab was loaded since the last eviction check
    pub evict_wanted: AtomicBool,
}

impl PoolCtx {
    pub fn new(tunables: Arc<TunablesHandle>, store: Arc<dyn ObjectStore>,
        allocators: usize, log_enabled: bool) -> Result<Self>
    {
        if allocators == 0 {
            return Err(Error::EINVAL);
        }
        let taskq = Taskq::new(tunables.load().preload_threads)?;
        Ok(PoolCtx {
            tunables,
            store,
            syncing_txg: AtomicU64::new(0),
            sync_pass: AtomicU32::new(0),
            checkpoint_txg: AtomicU64::new(0),
            log: log_enabled.then(|| Mutex::new(PoolLog::new())),
            epoch: Instant::now(),
            allocators,
            taskq,
            evict_wanted: AtomicBool::new(false),
        })
    }

    /// Milliseconds since the pool was opened
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn syncing_txg(&self) -> TxgT {
        TxgT(self.syncing_txg.load(Ordering::Relaxed))
    }

    pub fn sync_pass(&self) -> u32 {
        self.sync_pass.load(Ordering::Relaxed)
    }

    pub fn checkpoint_txg(&self) -> Option<TxgT> {
        match self.checkpoint_txg.load(Ordering::Relaxed) {
            0 => None,
            txg => Some(TxgT(txg))
        }
    }

    fn set_checkpoint_txg(&self, txg: Option<TxgT>) {
        self.checkpoint_txg.store(txg.map(u64::from).unwrap_or(0),
            Ordering::Relaxed);
    }

    /// Start the first sync pass of `txg`
    pub fn begin_sync(&self, txg: TxgT) {
        self.syncing_txg.store(txg.0, Ordering::Relaxed);
        self.sync_pass.store(1, Ordering::Relaxed);
    }

    fn next_pass(&self) -> u32 {
        self.sync_pass.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for PoolCtx {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("PoolCtx")
            .field("syncing_txg", &self.syncing_txg)
            .field("sync_pass", &self.sync_pass)
            .field("checkpoint_txg", &self.checkpoint_txg)
            .field("log", &self.log)
            .field("allocators", &self.allocators)
            .finish()
    }
}

/// Everything needed to open the pool again, stored in the label object
#[derive(Debug, Deserialize, Serialize)]
struct Label {
    /// Last synced txg
    txg: TxgT,
    allocators: usize,
    log_enabled: bool,
    classes: Vec<(ClassKind, StrategyKind)>,
    next_vdev: VdevT,
    vdevs: Vec<VdevLabel>,
    checkpoint_txg: Option<TxgT>,
    log_maps: Vec<(TxgT, ObjectT)>,
}

/// Settings fixed when a pool is created
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub allocators: usize,
    /// Use pool-wide log space maps
    pub log_enabled: bool,
    pub strategies: Vec<(ClassKind, StrategyKind)>,
    pub vdevs: Vec<VdevConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            allocators: 1,
            log_enabled: false,
            strategies: Vec::new(),
            vdevs: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn allocators(mut self, allocators: usize) -> Self {
        self.allocators = allocators;
        self
    }

    pub fn log_enabled(mut self, log_enabled: bool) -> Self {
        self.log_enabled = log_enabled;
        self
    }

    /// Use `strategy` for every metaslab of class `kind`
    pub fn strategy(mut self, kind: ClassKind, strategy: StrategyKind) -> Self
    {
        self.strategies.retain(|(k, _)| *k != kind);
        self.strategies.push((kind, strategy));
        self
    }

    pub fn vdev(mut self, config: VdevConfig) -> Self {
        self.vdevs.push(config);
        self
    }

    fn strategy_for(&self, kind: ClassKind) -> StrategyKind {
        self.strategies.iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }
}

/// A set of devices, their metaslabs, and the classes that allocate from them
pub struct Pool {
    ctx: Arc<PoolCtx>,
    /// Object holding the label
    label_object: ObjectT,
    classes: BTreeMap<ClassKind, Class>,
    vdevs: RwLock<BTreeMap<VdevT, Arc<Group>>>,
    next_vdev: AtomicU32,
    synced_txg: AtomicU64,
}

impl Pool {
    fn build_classes(ctx: &Arc<PoolCtx>,
        strategies: impl Fn(ClassKind) -> StrategyKind)
        -> BTreeMap<ClassKind, Class>
    {
        CLASSES.iter()
            .map(|&kind| (kind, Class::new(ctx.clone(), kind, strategies(kind))))
            .collect()
    }

    /// Create a brand new pool.  All of its space is available at once, and
    /// the first txg is [`TXG_INITIAL`].
    pub fn create(store: Arc<dyn ObjectStore>, config: PoolConfig,
        tunables: Arc<TunablesHandle>) -> Result<Self>
    {
        if store.dir_lookup(LABEL_KEY)?.is_some() {
            return Err(Error::EEXIST);
        }
        let ctx = Arc::new(PoolCtx::new(tunables, store, config.allocators,
            config.log_enabled)?);
        let classes = Self::build_classes(&ctx, |k| config.strategy_for(k));
        let mut vdevs = BTreeMap::new();
        for (i, vc) in config.vdevs.iter().enumerate() {
            let vdev = i as VdevT;
            let class = &classes[&vc.class];
            let mg = Group::create(ctx.clone(), class.acct.clone(), vdev, *vc,
                TXG_INITIAL)?;
            class.activate_group(&mg);
            vdevs.insert(vdev, mg);
        }
        let label_object = ctx.store.create()?;
        ctx.store.dir_insert(LABEL_KEY, label_object)?;
        let pool = Pool {
            ctx,
            label_object,
            classes,
            vdevs: RwLock::new(vdevs),
            next_vdev: AtomicU32::new(config.vdevs.len() as VdevT),
            synced_txg: AtomicU64::new(0),
        };
        pool.write_label(TxgT(0))?;
        info!(vdevs = config.vdevs.len(), allocators = config.allocators,
              log = config.log_enabled, "created pool");
        Ok(pool)
    }

    /// Open an existing pool
    pub fn open(store: Arc<dyn ObjectStore>, tunables: Arc<TunablesHandle>)
        -> Result<Self>
    {
        let label_object = store.dir_lookup(LABEL_KEY)?.ok_or(Error::ENOENT)?;
        let len = store.len(label_object)?;
        let mut buf = vec![0u8; len as usize];
        store.read(label_object, 0, &mut buf[..])?;
        let label: Label = LabelReader::new(buf)?.deserialize()?;

        let mut ctx = PoolCtx::new(tunables, store, label.allocators,
                                   label.log_enabled)?;
        if let Some(log) = ctx.log.as_mut() {
            *log.get_mut().unwrap() = PoolLog::open(&*ctx.store,
                &label.log_maps)?;
        }
        ctx.set_checkpoint_txg(label.checkpoint_txg);
        let ctx = Arc::new(ctx);
        let classes = Self::build_classes(&ctx, |kind| {
            label.classes.iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, s)| *s)
                .unwrap_or_default()
        });
        let mut vdevs = BTreeMap::new();
        for vl in label.vdevs.iter() {
            let class = &classes[&vl.config.class];
            let mg = Group::open(ctx.clone(), class.acct.clone(), vl)?;
            vdevs.insert(vl.id, mg);
        }
        if let Some(log) = ctx.log.as_ref() {
            Self::replay_log(&ctx, log, &vdevs)?;
        }
        for mg in vdevs.values() {
            classes[&mg.config().class].activate_group(mg);
        }
        let t = ctx.tunables.load();
        if t.debug_load {
            for mg in vdevs.values() {
                for ms in mg.metaslabs() {
                    ms.force_load(mg)?;
                }
            }
        }
        info!(txg = %label.txg, vdevs = vdevs.len(), "opened pool");
        Ok(Pool {
            ctx,
            label_object,
            classes,
            vdevs: RwLock::new(vdevs),
            next_vdev: AtomicU32::new(label.next_vdev),
            synced_txg: AtomicU64::new(label.txg.0),
        })
    }

    /// Rebuild every metaslab's unflushed changes from the pool-wide log
    fn replay_log(ctx: &PoolCtx, log: &Mutex<PoolLog>,
        vdevs: &BTreeMap<VdevT, Arc<Group>>) -> Result<()>
    {
        let mut entries = Vec::new();
        log.lock().unwrap().replay(&*ctx.store,
            |txg, kind, vdev, offset, size| {
                entries.push((txg, kind, vdev, offset, size))
            })?;
        let nentries = entries.len();
        for (txg, kind, vdev, offset, size) in entries {
            // Entries for removed devices are obsolete
            let Some(mg) = vdevs.get(&vdev) else { continue };
            let ms = mg.metaslab_at(offset)?;
            if txg >= ms.unflushed_txg() {
                ms.replay(kind, offset, size);
            }
        }
        let mut memused = 0;
        for mg in vdevs.values() {
            for ms in mg.metaslabs() {
                memused += ms.replay_done(mg);
                let flushed = ms.unflushed_txg();
                if flushed != TxgT(0) {
                    log.lock().unwrap().add_metaslab(flushed, mg.vdev(),
                                                     ms.id());
                }
            }
        }
        log.lock().unwrap().add_memused(memused);
        debug!(entries = nentries, memused, "replayed log space maps");
        Ok(())
    }

    fn write_label(&self, txg: TxgT) -> Result<()> {
        let vdevs = self.groups().iter()
            .map(|mg| mg.label())
            .collect::<Vec<_>>();
        let log_maps = self.ctx.log.as_ref()
            .map(|log| log.lock().unwrap().objects())
            .unwrap_or_default();
        let label = Label {
            txg,
            allocators: self.ctx.allocators,
            log_enabled: self.ctx.log.is_some(),
            classes: self.classes.iter()
                .map(|(&kind, class)| (kind, class.strategy()))
                .collect(),
            next_vdev: self.next_vdev.load(Ordering::Relaxed),
            vdevs,
            checkpoint_txg: self.ctx.checkpoint_txg(),
            log_maps,
        };
        let mut lw = LabelWriter::new();
        lw.serialize(&label)?;
        let buf = lw.into_bytes();
        self.ctx.store.truncate(self.label_object, 0)?;
        self.ctx.store.write(self.label_object, 0, &buf[..])
    }

    pub fn tunables(&self) -> &Arc<TunablesHandle> {
        &self.ctx.tunables
    }

    /// The last txg whose sync completed
    pub fn synced_txg(&self) -> TxgT {
        TxgT(self.synced_txg.load(Ordering::Relaxed))
    }

    pub fn allocators(&self) -> usize {
        self.ctx.allocators
    }

    pub fn class(&self, kind: ClassKind) -> &Class {
        &self.classes[&kind]
    }

    pub fn group(&self, vdev: VdevT) -> Result<Arc<Group>> {
        self.vdevs.read().unwrap().get(&vdev).cloned().ok_or(Error::ENXIO)
    }

    /// Every group, ordered by vdev id
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.vdevs.read().unwrap().values().cloned().collect()
    }

    fn metaslab(&self, vdev: VdevT, id: u64)
        -> Result<(Arc<Group>, Arc<Metaslab>)>
    {
        let mg = self.group(vdev)?;
        let ms = mg.metaslabs().get(id as usize).cloned().ok_or(Error::ENXIO)?;
        Ok((mg, ms))
    }

    /// Look up the metaslab holding `dva`, checking that the DVA is sane
    fn metaslab_for(&self, dva: &Dva) -> Result<(Arc<Group>, Arc<Metaslab>)>
    {
        let mg = self.group(dva.vdev)?;
        let ms = mg.metaslab_at(dva.offset)?.clone();
        let align = 1 << mg.config().ashift;
        if dva.asize == 0 || p2phase(dva.offset | dva.asize, align) != 0 ||
            dva.offset + dva.asize > ms.start() + ms.size()
        {
            return Err(Error::EINVAL);
        }
        Ok((mg, ms))
    }

    /// Add a device.  Its space becomes available once `txg` syncs.
    pub fn add_vdev(&self, config: VdevConfig, txg: TxgT) -> Result<VdevT> {
        let vdev = self.next_vdev.fetch_add(1, Ordering::Relaxed);
        let class = self.class(config.class);
        let mg = Group::create(self.ctx.clone(), class.acct.clone(), vdev,
                               config, txg)?;
        class.activate_group(&mg);
        self.vdevs.write().unwrap().insert(vdev, mg);
        info!(vdev, class = %config.class, asize = config.asize, %txg,
              "added vdev");
        Ok(vdev)
    }

    /// Remove an empty device.
    ///
    /// Fails with `EBUSY`, leaving the device in service, if anything is
    /// still allocated on it.
    pub fn remove_vdev(&self, vdev: VdevT) -> Result<()> {
        let mg = self.group(vdev)?;
        let class = self.class(mg.config().class);
        class.passivate_group(&mg);
        if !mg.metaslabs().iter().all(|ms| ms.is_vacant()) {
            class.activate_group(&mg);
            return Err(Error::EBUSY);
        }
        mg.set_removing(true);
        mg.destroy()?;
        self.vdevs.write().unwrap().remove(&vdev);
        info!(vdev, "removed vdev");
        Ok(())
    }

    pub fn set_health(&self, vdev: VdevT, health: Health) -> Result<()> {
        let mg = self.group(vdev)?;
        if mg.health() != health {
            info!(vdev, %health, "vdev health changed");
            mg.set_health(health);
        }
        Ok(())
    }

    fn throttled(&self, flags: AllocFlags) -> bool {
        self.ctx.tunables.load().alloc_throttle_enabled &&
            !flags.contains(AllocFlags::DONT_THROTTLE)
    }

    /// Allocate `ndvas` copies of a `psize`-byte block in class `kind`.
    ///
    /// If any copy can't be allocated, the earlier ones are undone.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(&self, kind: ClassKind, psize: u64, ndvas: usize,
        hint: Option<&BlockPtr>, txg: TxgT, flags: AllocFlags,
        allocator: usize) -> Result<BlockPtr>
    {
        if psize == 0 || ndvas == 0 || ndvas > 3 ||
            allocator >= self.ctx.allocators
        {
            return Err(Error::EINVAL);
        }
        let class = self.class(kind);
        let throttled = self.throttled(flags);
        let mut dvas: Vec<Dva> = Vec::with_capacity(ndvas);
        for d in 0..ndvas {
            let hintdva = hint.and_then(|bp| bp.dvas.get(d));
            match class.alloc_dva(psize, &dvas[..], hintdva, txg, flags,
                allocator)
            {
                Ok(dva) => {
                    if throttled {
                        self.group(dva.vdev)?.throttle.increment(allocator);
                    }
                    dvas.push(dva);
                }
                Err(e) => {
                    for dva in dvas.iter() {
                        let (mg, ms) = self.metaslab_for(dva)?;
                        ms.unalloc(dva.offset, dva.asize, txg)?;
                        if throttled {
                            mg.throttle.decrement(allocator, false);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(BlockPtr{dvas, birth: txg})
    }

    /// Release a block's queue-depth slots once its I/O is issued
    pub fn alloc_done(&self, bp: &BlockPtr, allocator: usize,
        flags: AllocFlags, io_complete: bool) -> Result<()>
    {
        if !self.throttled(flags) {
            return Ok(());
        }
        for dva in bp.dvas.iter() {
            self.group(dva.vdev)?.throttle.decrement(allocator, io_complete);
        }
        Ok(())
    }

    /// Free every copy of a block in `txg`.
    ///
    /// With `now`, the block must have been allocated in `txg`, and its space
    /// is immediately reusable.  Otherwise the space is held for
    /// `TXG_DEFER_SIZE` txgs after `txg` syncs.  Freeing a block that is
    /// already free fails with `ENOENT`, before any copy is freed.
    pub fn free(&self, bp: &BlockPtr, txg: TxgT, now: bool) -> Result<()> {
        let checkpointed = self.ctx.checkpoint_txg()
            .is_some_and(|c| bp.birth <= c);
        if !now {
            for dva in bp.dvas.iter() {
                let (_, ms) = self.metaslab_for(dva)?;
                ms.freeable(dva.offset, dva.asize)?;
            }
        }
        for dva in bp.dvas.iter() {
            let (mg, ms) = self.metaslab_for(dva)?;
            if now {
                ms.unalloc(dva.offset, dva.asize, txg)?;
            } else {
                ms.free(&mg, dva.offset, dva.asize, txg, checkpointed)?;
            }
        }
        Ok(())
    }

    /// Mark an existing block allocated, as when replaying an intent log.
    ///
    /// Every copy is checked before any is claimed.
    pub fn claim(&self, bp: &BlockPtr, txg: TxgT) -> Result<()> {
        for dva in bp.dvas.iter() {
            let (mg, ms) = self.metaslab_for(dva)?;
            ms.claim(&mg, dva.offset, dva.asize, TxgT(0))?;
        }
        if txg == TxgT(0) {
            return Ok(());
        }
        for dva in bp.dvas.iter() {
            let (mg, ms) = self.metaslab_for(dva)?;
            ms.claim(&mg, dva.offset, dva.asize, txg)?;
        }
        Ok(())
    }

    /// Reserve `count` throttle slots in class `kind`
    pub fn reserve(&self, kind: ClassKind, count: u64, allocator: usize,
        flags: AllocFlags) -> bool
    {
        self.class(kind).reserve(count, allocator, flags)
    }

    pub fn unreserve(&self, kind: ClassKind, count: u64, allocator: usize) {
        self.class(kind).unreserve(count, allocator)
    }

    /// Fold the oldest metaslabs' changes out of the pool-wide log
    fn flush_log(&self, txg: TxgT, flush_all: bool, t: &Tunables)
        -> Result<()>
    {
        let Some(log) = self.ctx.log.as_ref() else {
            return Ok(());
        };
        let candidates = log.lock().unwrap().flush_candidates(txg);
        let mut flushed = 0;
        for (vdev, id) in candidates {
            if !flush_all && flushed >= t.min_metaslabs_to_flush &&
                !log.lock().unwrap().over_limit(t)
            {
                break;
            }
            let Ok((mg, ms)) = self.metaslab(vdev, id) else {
                continue;
            };
            if ms.flush(&mg, txg)? {
                flushed += 1;
            }
        }
        debug!(%txg, flushed, "flushed metaslabs");
        Ok(())
    }

    fn sync_impl(&self, txg: TxgT, flush_all: bool) -> Result<()> {
        let t = self.ctx.tunables.load();
        self.ctx.begin_sync(txg);
        let groups = self.groups();
        self.flush_log(txg, flush_all, &t)?;
        let mut pass = 1;
        loop {
            let mut pending = false;
            for mg in groups.iter() {
                for id in mg.dirty_ids(txg) {
                    let ms = mg.metaslab(id);
                    if pass == 1 || ms.sync_pending(txg) {
                        ms.sync(mg, txg)?;
                    }
                    pending |= ms.sync_pending(txg);
                }
            }
            if !pending {
                break;
            }
            pass = self.ctx.next_pass();
        }
        if let Some(log) = self.ctx.log.as_ref() {
            log.lock().unwrap().destroy_obsolete(&*self.ctx.store, txg)?;
        }
        self.write_label(txg)?;
        self.synced_txg.store(txg.0, Ordering::Relaxed);
        debug!(%txg, passes = pass, "synced");
        Ok(())
    }

    /// Write out every change made in `txg`
    #[tracing::instrument(skip(self))]
    pub fn sync(&self, txg: TxgT) -> Result<()> {
        self.sync_impl(txg, false)
    }

    /// Finish `txg`: age deferred frees, publish space changes, and reassess
    /// every group.
    #[tracing::instrument(skip(self))]
    pub fn sync_done(&self, txg: TxgT) {
        let groups = self.groups();
        for mg in groups.iter() {
            for id in mg.take_dirty(txg) {
                mg.metaslab(id).sync_done(mg, txg);
            }
        }
        for mg in groups.iter() {
            mg.reassess();
        }
        self.evict();
    }

    /// Unload the least recently selected metaslabs while loaded free space
    /// indexes use too much memory.
    fn evict(&self) {
        if !self.ctx.evict_wanted.swap(false, Ordering::Relaxed) {
            return;
        }
        let t = self.ctx.tunables.load();
        let limit = t.mem_limit();
        let mut loaded = Vec::new();
        let mut total = 0;
        for mg in self.groups() {
            for ms in mg.metaslabs() {
                if let Some((mem, selected)) = ms.loaded_mem() {
                    total += mem;
                    loaded.push((selected, mg.clone(), ms.clone()));
                }
            }
        }
        if total <= limit {
            return;
        }
        loaded.sort_by_key(|(selected, mg, ms)| (*selected, mg.vdev(), ms.id()));
        for (_, mg, ms) in loaded {
            if total <= limit {
                break;
            }
            total -= ms.try_evict(&mg).min(total);
        }
        if total > limit {
            warn!(total, limit, "loaded metaslabs exceed the memory limit");
            self.ctx.evict_wanted.store(true, Ordering::Relaxed);
        }
    }

    /// Preserve every block born up to and including `txg`.  Frees of such
    /// blocks keep their space allocated until the checkpoint is discarded.
    pub fn checkpoint(&self, txg: TxgT) -> Result<()> {
        if self.ctx.checkpoint_txg().is_some() {
            return Err(Error::EEXIST);
        }
        self.ctx.set_checkpoint_txg(Some(txg));
        info!(%txg, "checkpointed pool");
        Ok(())
    }

    pub fn checkpoint_txg(&self) -> Option<TxgT> {
        self.ctx.checkpoint_txg()
    }

    /// Release everything that the checkpoint held.  The space is freed in
    /// `txg`.
    pub fn discard_checkpoint(&self, txg: TxgT) -> Result<()> {
        if self.ctx.checkpoint_txg().is_none() {
            return Err(Error::ENOENT);
        }
        self.ctx.set_checkpoint_txg(None);
        for mg in self.groups() {
            mg.discard_checkpoint(txg)?;
        }
        info!(%txg, "discarded checkpoint");
        Ok(())
    }

    /// Hand a metaslab's freed-but-untrimmed ranges to `sink`, as
    /// `(start, size)` pairs.  Returns the number of bytes handed over.
    pub fn trim_metaslab<F>(&self, vdev: VdevT, id: u64, mut sink: F)
        -> Result<u64>
        where F: FnMut(u64, u64)
    {
        let (mg, ms) = self.metaslab(vdev, id)?;
        ms.disable(&mg);
        let trim = ms.take_trim();
        trim.walk(|start, size| sink(start, size));
        ms.enable(&mg, false);
        Ok(trim.space())
    }

    /// Sync `txg`, flushing every metaslab out of the pool-wide log, so that
    /// the pool may be reopened without replaying it.
    pub fn export(&self, txg: TxgT) -> Result<()> {
        self.ctx.taskq.wait();
        self.sync_impl(txg, true)?;
        self.sync_done(txg);
        self.ctx.taskq.wait();
        info!(%txg, "exported pool");
        Ok(())
    }

    pub fn class_stats(&self, kind: ClassKind) -> ClassStats {
        self.class(kind).stats()
    }

    pub fn metaslab_info(&self, vdev: VdevT, id: u64) -> Result<MetaslabInfo> {
        self.metaslab(vdev, id).map(|(_, ms)| ms.info())
    }

    pub fn load_metaslab(&self, vdev: VdevT, id: u64) -> Result<()> {
        let (mg, ms) = self.metaslab(vdev, id)?;
        ms.force_load(&mg)
    }

    pub fn unload_metaslab(&self, vdev: VdevT, id: u64) -> Result<()> {
        let (mg, ms) = self.metaslab(vdev, id)?;
        ms.force_unload(&mg)
    }

    /// Rewrite a metaslab's space map when `txg` syncs
    pub fn condense_metaslab(&self, vdev: VdevT, id: u64, txg: TxgT)
        -> Result<()>
    {
        let (mg, ms) = self.metaslab(vdev, id)?;
        ms.request_condense(&mg, txg);
        Ok(())
    }

    /// A loaded metaslab's free segments, as `(start, end)` pairs
    pub fn free_segments(&self, vdev: VdevT, id: u64)
        -> Result<Option<Vec<(u64, u64)>>>
    {
        self.metaslab(vdev, id).map(|(_, ms)| ms.free_segments())
    }

    pub fn space_summary(&self, vdev: VdevT, id: u64)
        -> Result<Option<SpaceSummary>>
    {
        self.metaslab(vdev, id).map(|(_, ms)| ms.space_summary())
    }

    /// Might this metaslab satisfy an allocation of `asize` bytes?  Never
    /// loads anything.
    pub fn should_allocate(&self, vdev: VdevT, id: u64, asize: u64)
        -> Result<bool>
    {
        let t = self.ctx.tunables.load();
        let (_, ms) = self.metaslab(vdev, id)?;
        let weight = ms.info().weight;
        Ok(ms.should_allocate(weight, asize, false, self.ctx.now_ms(), &t))
    }

    /// Wait for every background preload to finish
    pub fn wait_preloads(&self) {
        self.ctx.taskq.wait();
    }
}

impl Display for Pool {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for class in self.classes.values() {
            if class.groups().is_empty() {
                continue;
            }
            write!(f, "{}", class.stats())?;
            for mg in class.groups() {
                write!(f, "{mg}")?;
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;
use crate::object_store::{MemStore, MockObjectStore};

fn tunables() -> Arc<TunablesHandle> {
    Arc::new(TunablesHandle::new(Tunables {
        preload_enabled: false,
        debug_verify: true,
        ..Default::default()
    }))
}

fn config() -> PoolConfig {
    PoolConfig::default()
        .vdev(VdevConfig::new(32 << 20).ms_shift(20))
        .vdev(VdevConfig::new(32 << 20).ms_shift(20))
}

#[test]
fn create_twice() {
    let store = Arc::new(MemStore::new());
    Pool::create(store.clone(), config(), tunables()).unwrap();
    assert_eq!(Err(Error::EEXIST),
        Pool::create(store, config(), tunables()).map(drop));
}

#[test]
fn open_without_label() {
    let mut store = MockObjectStore::new();
    store.expect_dir_lookup()
        .return_const(Ok(None));
    assert_eq!(Err(Error::ENOENT),
        Pool::open(Arc::new(store), tunables()).map(drop));
}

#[test]
fn zero_allocators() {
    let store = Arc::new(MemStore::new());
    let config = config().allocators(0);
    assert_eq!(Err(Error::EINVAL),
        Pool::create(store, config, tunables()).map(drop));
}

#[test]
fn alloc_invalid() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    let txg = TXG_INITIAL;
    assert_eq!(Err(Error::EINVAL),
        pool.alloc(ClassKind::Normal, 0, 1, None, txg, AllocFlags::NONE, 0));
    assert_eq!(Err(Error::EINVAL),
        pool.alloc(ClassKind::Normal, 4096, 4, None, txg, AllocFlags::NONE,
                   0));
    assert_eq!(Err(Error::EINVAL),
        pool.alloc(ClassKind::Normal, 4096, 1, None, txg, AllocFlags::NONE,
                   1));
}

#[test]
fn alloc_empty_class() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    assert_eq!(Err(Error::ENOSPC),
        pool.alloc(ClassKind::Special, 4096, 1, None, TXG_INITIAL,
                   AllocFlags::NONE, 0));
}

/// A failed second copy releases the first
#[test]
fn alloc_undoes_partial() {
    let store = Arc::new(MemStore::new());
    let config = PoolConfig::default()
        .vdev(VdevConfig::new(16 << 20).ms_shift(20));
    let pool = Pool::create(store, config, tunables()).unwrap();
    let txg = TXG_INITIAL;
    // Fill all but one metaslab
    for _ in 0..15 {
        pool.alloc(ClassKind::Normal, 1 << 20, 1, None, txg,
                   AllocFlags::DONT_THROTTLE, 0).unwrap();
    }
    assert_eq!(Err(Error::ENOSPC),
        pool.alloc(ClassKind::Normal, 1 << 20, 2, None, txg,
                   AllocFlags::DONT_THROTTLE, 0));
    let allocating: u64 = (0..16)
        .filter_map(|id| pool.space_summary(0, id).unwrap())
        .map(|s| s.allocating)
        .sum();
    assert_eq!(allocating, 15 << 20);
}

#[test]
fn queue_depth() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    let bp = pool.alloc(ClassKind::Normal, 4096, 2, None, TXG_INITIAL,
                        AllocFlags::NONE, 0).unwrap();
    for dva in bp.dvas.iter() {
        assert_eq!(pool.group(dva.vdev).unwrap().throttle.depth(0), 1);
    }
    pool.alloc_done(&bp, 0, AllocFlags::NONE, true).unwrap();
    for dva in bp.dvas.iter() {
        let mg = pool.group(dva.vdev).unwrap();
        assert_eq!(mg.throttle.depth(0), 0);
        assert_eq!(mg.throttle.cur_max(0), 33);
    }
}

#[test]
fn free_bogus_dva() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    let txg = TXG_INITIAL;
    let bp = |vdev, offset, asize| BlockPtr {
        dvas: vec![Dva::new(vdev, offset, asize)],
        birth: txg
    };
    assert_eq!(Err(Error::ENXIO), pool.free(&bp(7, 0, 4096), txg, false));
    assert_eq!(Err(Error::ENXIO),
        pool.free(&bp(0, 64 << 20, 4096), txg, false));
    assert_eq!(Err(Error::EINVAL), pool.free(&bp(0, 100, 4096), txg, false));
    // Straddles two metaslabs
    assert_eq!(Err(Error::EINVAL),
        pool.free(&bp(0, (1 << 20) - 4096, 8192), txg, false));
}

#[test]
fn set_health() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    pool.set_health(1, Health::Faulted).unwrap();
    assert_eq!(pool.group(1).unwrap().health(), Health::Faulted);
    assert_eq!(Err(Error::ENXIO), pool.set_health(9, Health::Online));
}

#[test]
fn checkpoint_twice() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    assert_eq!(Err(Error::ENOENT), pool.discard_checkpoint(TXG_INITIAL));
    pool.checkpoint(TXG_INITIAL).unwrap();
    assert_eq!(Err(Error::EEXIST), pool.checkpoint(TXG_INITIAL));
    assert_eq!(pool.checkpoint_txg(), Some(TXG_INITIAL));
}

#[test]
fn display() {
    let store = Arc::new(MemStore::new());
    let pool = Pool::create(store, config(), tunables()).unwrap();
    let s = format!("{pool}");
    assert!(s.starts_with("class normal (df)"));
    assert!(s.contains("vdev 0: normal Online, 32 metaslabs"));
    assert!(s.contains("vdev 1: normal Online, 32 metaslabs"));
    assert!(!s.contains("class special"));
}
}
// LCOV_EXCL_STOP
