// vim: tw=80
//! Pool-wide log space maps
//!
//! With logging enabled, metaslabs don't append to their own space maps every
//! txg.  Instead, every metaslab's changes for one txg go to a single log
//! space map, and each metaslab remembers its changes since its last flush in
//! memory.  A few metaslabs are flushed every txg, and log space maps that no
//! metaslab depends upon any longer are destroyed.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use crate::{
    object_store::ObjectStore,
    space_map::{MapType, SmEntry, SpaceMap},
    tunables::Tunables,
    types::*,
};

/// Log space maps cover every device, so they span the whole address space.
const LOG_SM_START: u64 = 0;
const LOG_SM_SIZE: u64 = u64::MAX;
const LOG_SM_SHIFT: u32 = SPA_MINBLOCKSHIFT;

#[derive(Debug, Default)]
pub(crate) struct PoolLog {
    /// One log space map per txg that wrote anything
    maps: BTreeMap<TxgT, SpaceMap>,
    /// Every metaslab with unflushed changes, oldest first
    by_flushed: BTreeSet<(TxgT, VdevT, u64)>,
    /// Memory used by all metaslabs' unflushed trees
    memused: u64,
}

impl PoolLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the log space maps recorded in the label
    pub fn open(store: &dyn ObjectStore, maps: &[(TxgT, ObjectT)])
        -> Result<Self>
    {
        let maps = maps.iter()
            .map(|&(txg, object)| {
                SpaceMap::open(store, object, LOG_SM_START, LOG_SM_SIZE,
                               LOG_SM_SHIFT)
                .map(|sm| (txg, sm))
            }).collect::<Result<BTreeMap<_, _>>>()?;
        Ok(PoolLog{maps, ..Default::default()})
    }

    /// Append one txg's worth of changes for one device
    pub fn write(&mut self, store: &dyn ObjectStore, txg: TxgT,
        segs: Vec<(u64, u64)>, kind: MapType, vdev: VdevT, pass: u32)
        -> Result<()>
    {
        if segs.is_empty() {
            return Ok(());
        }
        if !self.maps.contains_key(&txg) {
            let sm = SpaceMap::create(store, LOG_SM_START, LOG_SM_SIZE,
                                      LOG_SM_SHIFT)?;
            debug!(%txg, object = sm.object(), "created log space map");
            self.maps.insert(txg, sm);
        }
        let sm = self.maps.get_mut(&txg).ok_or(Error::ENOENT)?;
        sm.write(store, segs, kind, Some(vdev), txg, pass)
    }

    /// Start tracking a metaslab whose first unflushed change is from `txg`
    pub fn add_metaslab(&mut self, txg: TxgT, vdev: VdevT, id: u64) {
        self.by_flushed.insert((txg, vdev, id));
    }

    pub fn remove_metaslab(&mut self, txg: TxgT, vdev: VdevT, id: u64) {
        self.by_flushed.remove(&(txg, vdev, id));
    }

    /// Record that a metaslab has been flushed as of `new`
    pub fn bump(&mut self, old: TxgT, new: TxgT, vdev: VdevT, id: u64) {
        self.by_flushed.remove(&(old, vdev, id));
        self.by_flushed.insert((new, vdev, id));
    }

    pub fn add_memused(&mut self, bytes: u64) {
        self.memused += bytes;
    }

    pub fn sub_memused(&mut self, bytes: u64) {
        self.memused = self.memused.saturating_sub(bytes);
    }

    pub fn memused(&self) -> u64 {
        self.memused
    }

    /// The oldest txg that some metaslab still needs from the log
    fn oldest_needed(&self) -> Option<TxgT> {
        self.by_flushed.first().map(|&(txg, _, _)| txg)
    }

    /// Number of log space maps that some metaslab still needs
    pub fn live_txgs(&self) -> usize {
        match self.oldest_needed() {
            Some(oldest) => self.maps.range(oldest..).count(),
            None => 0
        }
    }

    /// Should more metaslabs be flushed this txg?
    pub fn over_limit(&self, t: &Tunables) -> bool {
        self.live_txgs() as u64 > t.unflushed_log_txg_max ||
            self.memused > t.unflushed_mem_limit()
    }

    /// Metaslabs eligible for flushing in `txg`, oldest first
    pub fn flush_candidates(&self, txg: TxgT) -> Vec<(VdevT, u64)> {
        self.by_flushed.iter()
            .filter(|&&(flushed, _, _)| flushed < txg)
            .map(|&(_, vdev, id)| (vdev, id))
            .collect()
    }

    /// Destroy every log space map that no metaslab needs any longer
    pub fn destroy_obsolete(&mut self, store: &dyn ObjectStore,
        syncing: TxgT) -> Result<()>
    {
        let keep = self.oldest_needed().unwrap_or(syncing + 1);
        let obsolete = self.maps.range(..keep)
            .map(|(&txg, _)| txg)
            .collect::<Vec<_>>();
        for txg in obsolete {
            if let Some(sm) = self.maps.remove(&txg) {
                debug!(%txg, object = sm.object(), "destroying log space map");
                sm.destroy(store)?;
            }
        }
        Ok(())
    }

    /// Call `f(txg, kind, vdev, offset, size)` for every logged change, in
    /// the order they were written.
    pub fn replay<F>(&self, store: &dyn ObjectStore, mut f: F) -> Result<()>
        where F: FnMut(TxgT, MapType, VdevT, u64, u64)
    {
        for (&txg, sm) in self.maps.iter() {
            sm.iterate(store, sm.length(), |entry| {
                match entry {
                    SmEntry::Range{kind, offset, run, vdev: Some(vdev)} => {
                        f(txg, kind, vdev, offset, run);
                        Ok(())
                    }
                    SmEntry::Range{vdev: None, ..} => Err(Error::EINTEGRITY),
                    SmEntry::Debug{..} => Ok(())
                }
            })?;
        }
        Ok(())
    }

    /// Objects of every log space map, for the label
    pub fn objects(&self) -> Vec<(TxgT, ObjectT)> {
        self.maps.iter()
            .map(|(&txg, sm)| (txg, sm.object()))
            .collect()
    }
}

// LCOV_EXCL_STOP
