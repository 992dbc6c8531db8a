// vim: tw=80
//! Metaslab classes: allocation dispatch across a set of groups
//!
//! Each class owns a ring of groups, ordered by vdev id, and one rotor per
//! allocator.  Consecutive allocations stay in the rotor's group until an
//! aliquot's worth of bytes has been handed out, then move to the next one.

use std::{
    fmt::{self, Display, Formatter},
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
};
use tracing::{debug, trace};
use crate::{
    allocator::{AllocStrategy, AllocStrategyApi, StrategyKind},
    group::{Group, GroupStats},
    pool::PoolCtx,
    throttle::ClassThrottle,
    types::*,
    util::p2roundup,
    vdev::{ClassKind, Health},
};

/// Ditto copies on the same device start out needing to be `asize >>
/// DITTO_DISTANCE_SHIFT` bytes apart.
const DITTO_DISTANCE_SHIFT: u32 = 3;

/// Space accounting shared by a class and its groups
#[derive(Debug)]
pub(crate) struct ClassAccounting {
    pub kind: ClassKind,
    pub strategy: AllocStrategy,
    alloc: AtomicI64,
    deferred: AtomicI64,
    space: AtomicI64,
    /// Free segments of every member metaslab with a space map, by size class
    pub histogram: Mutex<[u64; RANGE_TREE_HISTOGRAM_SIZE]>,
    /// Groups with any space
    groups: AtomicUsize,
    /// Groups that allocations currently consider
    alloc_groups: AtomicUsize,
    pub throttle: ClassThrottle,
}

impl ClassAccounting {
    pub fn new(kind: ClassKind, strategy: AllocStrategy, allocators: usize)
        -> Self
    {
        ClassAccounting {
            kind,
            strategy,
            alloc: AtomicI64::new(0),
            deferred: AtomicI64::new(0),
            space: AtomicI64::new(0),
            histogram: Mutex::new([0; RANGE_TREE_HISTOGRAM_SIZE]),
            groups: AtomicUsize::new(0),
            alloc_groups: AtomicUsize::new(0),
            throttle: ClassThrottle::new(allocators),
        }
    }

    pub fn space(&self) -> u64 {
        self.space.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn alloc(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn space_update(&self, alloc: i64, defer: i64, space: i64) {
        self.alloc.fetch_add(alloc, Ordering::Relaxed);
        self.deferred.fetch_add(defer, Ordering::Relaxed);
        self.space.fetch_add(space, Ordering::Relaxed);
    }

    pub fn groups(&self) -> usize {
        self.groups.load(Ordering::Relaxed)
    }

    pub fn alloc_groups(&self) -> usize {
        self.alloc_groups.load(Ordering::Relaxed)
    }

    pub fn groups_changed(&self, up: bool) {
        if up {
            self.groups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.groups.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn alloc_groups_changed(&self, up: bool) {
        if up {
            self.alloc_groups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.alloc_groups.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// One allocator's position in the ring
#[derive(Clone, Copy, Debug, Default)]
struct Rotor {
    /// The group that allocations start from, by vdev id
    vdev: Option<VdevT>,
    /// Bytes allocated from that group since the rotor last moved
    aliquot: u64,
}

/// Point-in-time statistics for one class
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassStats {
    pub kind: ClassKind,
    pub strategy: StrategyKind,
    pub space: u64,
    pub alloc: u64,
    pub deferred: u64,
    pub groups: usize,
    pub alloc_groups: usize,
    /// Space-weighted mean of the groups' fragmentation
    pub fragmentation: Option<u64>,
    pub histogram: [u64; RANGE_TREE_HISTOGRAM_SIZE],
    pub vdevs: Vec<GroupStats>,
}

impl Display for ClassStats {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let frag = self.fragmentation
            .map(|f| format!("{f}%"))
            .unwrap_or_else(|| "-".to_owned());
        writeln!(f, "class {} ({}): {} of {} bytes allocated, {} deferred, \
                 {}/{} groups allocatable, {} fragmented",
                 self.kind, self.strategy, self.alloc, self.space,
                 self.deferred, self.alloc_groups, self.groups, frag)?;
        let nonempty = self.histogram.iter()
            .enumerate()
            .filter(|(_, &c)| c > 0);
        for (i, c) in nonempty {
            writeln!(f, "{:>20}: {}", 1u128 << i, c)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Class {
    ctx: Arc<PoolCtx>,
    pub(crate) acct: Arc<ClassAccounting>,
    /// Activated groups, ordered by vdev id
    ring: RwLock<Vec<Arc<Group>>>,
    rotors: Vec<Mutex<Rotor>>,
}

impl Class {
    pub(crate) fn new(ctx: Arc<PoolCtx>, kind: ClassKind,
        strategy: StrategyKind) -> Self
    {
        let allocators = ctx.allocators;
        let acct = Arc::new(ClassAccounting::new(kind, strategy.into(),
                                                 allocators));
        let rotors = (0..allocators)
            .map(|_| Mutex::new(Rotor::default()))
            .collect();
        Class {
            ctx,
            acct,
            ring: RwLock::new(Vec::new()),
            rotors,
        }
    }

    pub fn kind(&self) -> ClassKind {
        self.acct.kind
    }

    pub fn strategy(&self) -> StrategyKind {
        self.acct.strategy.kind()
    }

    pub fn space(&self) -> u64 {
        self.acct.space()
    }

    pub fn alloc(&self) -> u64 {
        self.acct.alloc()
    }

    pub fn deferred(&self) -> u64 {
        self.acct.deferred()
    }

    /// Every activated group, in ring order
    pub(crate) fn groups(&self) -> Vec<Arc<Group>> {
        self.ring.read().unwrap().clone()
    }

    /// Add a group to the ring and make it eligible for allocations
    pub(crate) fn activate_group(&self, mg: &Arc<Group>) {
        let t = self.ctx.tunables.load();
        if mg.is_activated() {
            return;
        }
        {
            let mut ring = self.ring.write().unwrap();
            let pos = ring.partition_point(|g| g.vdev() < mg.vdev());
            ring.insert(pos, mg.clone());
            self.acct.throttle.add_max(mg.throttle.max() as i64);
            mg.throttle.reset(t.alloc_initial_queue_depth);
            // Spread the allocators' rotors across the ring
            let len = ring.len();
            for (i, rotor) in self.rotors.iter().enumerate() {
                let mut r = rotor.lock().unwrap();
                r.vdev = Some(ring[(pos + i) % len].vdev());
                r.aliquot = 0;
            }
            mg.set_activated(true);
        }
        mg.alloc_update();
        debug!(class = %self.acct.kind, vdev = mg.vdev(), "activated group");
    }

    /// Remove a group from the ring.  Its active metaslabs are passivated, so
    /// no new allocations will land on it.
    pub(crate) fn passivate_group(&self, mg: &Arc<Group>) {
        if !mg.is_activated() {
            return;
        }
        // Preloads hold references to the group's metaslabs
        self.ctx.taskq.wait();
        mg.set_activated(false);
        mg.alloc_update();
        mg.passivate_all();
        let mut ring = self.ring.write().unwrap();
        if let Some(pos) = ring.iter().position(|g| Arc::ptr_eq(g, mg)) {
            ring.remove(pos);
            let next = (!ring.is_empty())
                .then(|| ring[pos % ring.len()].vdev());
            for rotor in self.rotors.iter() {
                let mut r = rotor.lock().unwrap();
                if r.vdev == Some(mg.vdev()) {
                    r.vdev = next;
                    r.aliquot = 0;
                }
            }
            self.acct.throttle.add_max(-(mg.throttle.max() as i64));
        }
        debug!(class = %self.acct.kind, vdev = mg.vdev(), "passivated group");
    }

    /// Should `mg` be tried for this allocation, given the throttle and the
    /// state of the class's other groups?
    fn allocatable(&self, ring: &[Arc<Group>], idx: usize, rotor: usize,
        flags: AllocFlags, psize: u64, allocator: usize, d: usize) -> bool
    {
        let t = self.ctx.tunables.load();
        let mg = &ring[idx];
        if self.acct.kind == ClassKind::Log || self.acct.groups() <= 1 {
            return true;
        }
        if mg.is_allocatable() {
            if !t.alloc_throttle_enabled {
                return true;
            }
            if mg.no_free_space() {
                return false;
            }
            if flags.contains(AllocFlags::DONT_THROTTLE) {
                return true;
            }
            let qmax = |g: &Group| {
                g.throttle.cur_max(allocator) * (4 + d as u64) / 4
            };
            if mg.throttle.depth(allocator) < qmax(mg) ||
                self.acct.alloc_groups() == 1
            {
                return true;
            }
            // Every later group up to the rotor is also full, so use this one
            // rather than stall.
            let mut i = (idx + 1) % ring.len();
            while i != rotor {
                let g = &ring[i];
                if g.throttle.depth(allocator) < qmax(g) &&
                    g.is_allocatable() && !g.no_free_space()
                {
                    trace!(vdev = mg.vdev(), allocator, "group throttled");
                    return false;
                }
                i = (i + 1) % ring.len();
            }
            true
        } else {
            // Once every group is below the thresholds, open all of them.
            self.acct.alloc_groups() == 0 || psize == SPA_MINBLOCKSIZE
        }
    }

    fn rotor_advance(&self, allocator: usize, ring: &[Arc<Group>], idx: usize)
    {
        let mut r = self.rotors[allocator].lock().unwrap();
        r.vdev = Some(ring[(idx + 1) % ring.len()].vdev());
        r.aliquot = 0;
    }

    /// Allocate copy number `dvas.len()` of a block.
    ///
    /// `dvas` holds the block's earlier copies, and `hint` the corresponding
    /// copy of a related block that this one should follow.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn alloc_dva(&self, psize: u64, dvas: &[Dva],
        hint: Option<&Dva>, txg: TxgT, flags: AllocFlags, allocator: usize)
        -> Result<Dva>
    {
        let t = self.ctx.tunables.load();
        let d = dvas.len();
        let ring = self.groups();
        if ring.is_empty() {
            return Err(Error::ENOSPC);
        }
        let position = |vdev: VdevT| ring.iter().position(|g| g.vdev() == vdev);
        let rotor_vdev = self.rotors[allocator].lock().unwrap().vdev;
        let start = if let Some(pos) = hint.and_then(|h| position(h.vdev)) {
            if flags.contains(AllocFlags::HINTBP_AVOID) {
                (pos + 1) % ring.len()
            } else {
                pos
            }
        } else if let Some(pos) = dvas.last().and_then(|p| position(p.vdev)) {
            (pos + 1) % ring.len()
        } else {
            rotor_vdev.and_then(position).unwrap_or(0)
        };
        let gang = flags.contains(AllocFlags::GANG_HEADER) ||
            flags.contains(AllocFlags::GANG_CHILD);
        let mut try_hard = false;
        let mut dshift = DITTO_DISTANCE_SHIFT;

        loop {
            let mut all_zero = true;
            let mut idx = start;
            loop {
                let mg = &ring[idx];
                let health = mg.health();
                let mut ok = health != Health::Faulted && mg.is_activated() &&
                    !mg.is_removing();
                if ok && !gang && !try_hard {
                    ok = self.allocatable(&ring, idx, start, flags, psize,
                                          allocator, d);
                }
                // Keep single copies off of ailing devices while there's
                // anywhere else to go
                if ok && d == 0 && !try_hard && health != Health::Online {
                    ok = false;
                }
                if ok {
                    let config = mg.config();
                    let mut distance = 0;
                    if !try_hard {
                        distance = config.asize >> dshift;
                        if distance <= config.ms_size() {
                            distance = 0;
                        } else {
                            all_zero = false;
                        }
                    }
                    let asize = p2roundup(psize, 1 << config.ashift);
                    if let Some(offset) = mg.alloc_dva(allocator, asize, txg,
                        !try_hard, dvas, distance, try_hard)
                    {
                        let mut r = self.rotors[allocator].lock().unwrap();
                        if r.aliquot == 0 && t.bias_enabled {
                            let vs_free = mg.space() as i64 - mg.alloc() as i64;
                            let mc_free = self.space() as i64 -
                                self.alloc() as i64;
                            let alloc_groups = self.acct.alloc_groups() as i64;
                            let ratio = (vs_free * alloc_groups * 100) /
                                (mc_free + 1);
                            mg.bias.store((ratio - 100) * t.aliquot as i64 / 100,
                                Ordering::Relaxed);
                        } else if !t.bias_enabled {
                            mg.bias.store(0, Ordering::Relaxed);
                        }
                        r.aliquot += asize;
                        let quota = t.aliquot as i64 +
                            mg.bias.load(Ordering::Relaxed);
                        if flags.contains(AllocFlags::ZIL) ||
                            r.aliquot as i64 >= quota
                        {
                            r.vdev = Some(ring[(idx + 1) % ring.len()].vdev());
                            r.aliquot = 0;
                        }
                        trace!(class = %self.acct.kind, vdev = mg.vdev(),
                               offset, asize, d, "allocated dva");
                        let mut dva = Dva::new(mg.vdev(), offset, asize);
                        dva.gang = flags.contains(AllocFlags::GANG_HEADER);
                        return Ok(dva);
                    }
                }
                self.rotor_advance(allocator, &ring, idx);
                idx = (idx + 1) % ring.len();
                if idx == start {
                    break;
                }
            }
            if !all_zero {
                dshift += 1;
                continue;
            }
            if !try_hard && (t.try_hard_before_gang || gang ||
                psize <= SPA_MINBLOCKSIZE)
            {
                try_hard = true;
                continue;
            }
            debug!(class = %self.acct.kind, psize, d, "allocation failed");
            return Err(Error::ENOSPC);
        }
    }

    /// Space-weighted mean fragmentation of the member groups
    pub fn fragmentation(&self) -> Option<u64> {
        let (weighted, space) = self.groups().iter()
            .filter_map(|mg| mg.fragmentation().map(|f| (f, mg.space())))
            .fold((0u128, 0u128), |(w, s), (f, space)| {
                (w + u128::from(f) * u128::from(space), s + u128::from(space))
            });
        (space > 0).then(|| (weighted / space) as u64)
    }

    pub fn stats(&self) -> ClassStats {
        let ring = self.groups();
        ClassStats {
            kind: self.kind(),
            strategy: self.strategy(),
            space: self.space(),
            alloc: self.alloc(),
            deferred: self.deferred(),
            groups: self.acct.groups(),
            alloc_groups: self.acct.alloc_groups(),
            fragmentation: self.fragmentation(),
            histogram: *self.acct.histogram.lock().unwrap(),
            vdevs: ring.iter().map(|mg| mg.stats()).collect(),
        }
    }

    /// Try to reserve `count` throttle slots for `allocator`
    pub(crate) fn reserve(&self, count: u64, allocator: usize,
        flags: AllocFlags) -> bool
    {
        let t = self.ctx.tunables.load();
        if !t.alloc_throttle_enabled {
            return true;
        }
        self.acct.throttle.reserve(count, allocator, flags)
    }

    pub(crate) fn unreserve(&self, count: u64, allocator: usize) {
        let t = self.ctx.tunables.load();
        if t.alloc_throttle_enabled {
            self.acct.throttle.unreserve(count, allocator);
        }
    }

    pub(crate) fn reserved(&self, allocator: usize) -> u64 {
        self.acct.throttle.reserved(allocator)
    }

    pub(crate) fn max_slots(&self, allocator: usize) -> u64 {
        self.acct.throttle.max_slots(allocator)
    }
}

// LCOV_EXCL_STOP
