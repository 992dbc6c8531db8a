// vim: tw=80
//! Allocator knobs
//!
//! Every knob has a default and may be changed while the pool is running.
//! Operations take one snapshot of the whole set when they begin, so a change
//! takes effect at the next operation rather than in the middle of one.

use serde_derive::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use crate::types::*;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Bytes to allocate from one group before moving the rotor to the next.
    pub aliquot: u64,
    /// Skew each group's aliquot by how much emptier it is than the class
    /// average.
    pub bias_enabled: bool,
    /// Condense a space map once it is this many percent of its optimal size.
    pub condense_pct: u64,
    /// Never condense a space map smaller than this many records.
    pub condense_block_threshold: u64,
    /// Record size used when estimating space map sizes.
    pub sm_block_size: u64,
    /// Groups with less free capacity than this percentage are skipped while
    /// any other group is still above it.
    pub group_noalloc_threshold: u64,
    /// Groups more fragmented than this percentage are skipped while any
    /// other group is still allocatable.
    pub group_fragmentation_threshold: u64,
    /// Active, space-weighted metaslabs more fragmented than this are
    /// passivated so that better ones can be selected.
    pub fragmentation_threshold: u64,
    /// Scale space-based weights by fragmentation.
    pub fragmentation_factor_enabled: bool,
    /// Favor low offsets on rotational media.
    pub lba_weighting_enabled: bool,
    /// Rank metaslabs by their largest free segment class rather than by
    /// their free space.
    pub segment_weight_enabled: bool,
    /// Passivate a segment-weighted metaslab once its best bucket has
    /// dropped this many buckets since activation.
    pub switch_threshold: u32,
    /// Unload metaslabs that have not been selected for this many txgs...
    pub unload_delay: u64,
    /// ...and for this many milliseconds.
    pub unload_delay_ms: u64,
    /// How long an unloaded metaslab's cached maximum segment size is
    /// trusted.
    pub max_size_cache_sec: u64,
    pub preload_enabled: bool,
    /// Metaslabs per group to load ahead of need.
    pub preload_limit: usize,
    /// Size of the background preload pool.
    pub preload_threads: usize,
    /// Percentage of `system_memory` that loaded free-space indexes may use
    /// before metaslabs are evicted.
    pub mem_limit_pct: u64,
    /// Memory available to the allocator, in bytes.
    pub system_memory: u64,
    /// Dynamic-fit switches to size-indexed lookup when the largest free
    /// segment is smaller than this.
    pub df_alloc_threshold: u64,
    /// Dynamic-fit switches to size-indexed lookup when less than this
    /// percentage of the metaslab is free.
    pub df_free_pct: u64,
    /// Maximum distance in bytes that dynamic-fit scans from its cursor.
    pub df_max_search: u64,
    /// On a dynamic-fit miss, use the largest segment instead of the best
    /// fitting one.
    pub df_use_largest_segment: bool,
    /// Minimum number of segments that a cursor scan examines.
    pub min_search_count: u64,
    /// New-dynamic-fit searches for segments up to `1 << (size class +
    /// ndf_clump_shift)`.
    pub ndf_clump_shift: u32,
    /// Candidate metaslabs examined per group before giving up, unless trying
    /// hard.
    pub find_max_tries: u64,
    /// Retry in try-hard mode before failing an allocation that could be
    /// ganged instead.  When clear, only gang allocations and those of the
    /// smallest block size get a try-hard pass.
    pub try_hard_before_gang: bool,
    /// Segments smaller than `1 << size_index_floor_shift` are omitted from
    /// the size index.
    pub size_index_floor_shift: u32,
    pub alloc_throttle_enabled: bool,
    /// Queue depth that each group's limit starts at.
    pub alloc_initial_queue_depth: u64,
    /// Largest queue depth that a group's limit may grow to.
    pub alloc_max_queue_depth: u64,
    /// Maximum concurrently disabled metaslabs per group.
    pub max_disabled_per_group: u64,
    /// Deferred frees are disabled when the class's free space drops below
    /// `1 / 2^slop_shift` of its capacity.
    pub slop_shift: u32,
    /// Remember freed ranges for trimming.
    pub autotrim: bool,
    /// Load every metaslab when the pool is opened.
    pub debug_load: bool,
    /// Never unload metaslabs.
    pub debug_unload: bool,
    /// Cross-check in-core and on-disk space accounting.  Expensive.
    pub debug_verify: bool,
    /// Flush metaslabs once unflushed changes use this many parts per million
    /// of `system_memory`.
    pub unflushed_max_mem_ppm: u64,
    /// Flush metaslabs so that no more than this many txgs of log space maps
    /// are live.
    pub unflushed_log_txg_max: u64,
    /// Flush at least this many metaslabs per txg when logging.
    pub min_metaslabs_to_flush: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            aliquot: 512 << 10,
            bias_enabled: true,
            condense_pct: 200,
            condense_block_threshold: 4,
            sm_block_size: 1 << 14,
            group_noalloc_threshold: 0,
            group_fragmentation_threshold: 95,
            fragmentation_threshold: 70,
            fragmentation_factor_enabled: true,
            lba_weighting_enabled: true,
            segment_weight_enabled: true,
            switch_threshold: 2,
            unload_delay: 32,
            unload_delay_ms: 10 * 60 * 1000,
            max_size_cache_sec: 3600,
            preload_enabled: true,
            preload_limit: 10,
            preload_threads: 4,
            mem_limit_pct: 25,
            system_memory: 8 << 30,
            df_alloc_threshold: SPA_OLD_MAXBLOCKSIZE,
            df_free_pct: 4,
            df_max_search: 16 << 20,
            df_use_largest_segment: false,
            min_search_count: 100,
            ndf_clump_shift: 4,
            find_max_tries: 100,
            try_hard_before_gang: true,
            size_index_floor_shift: 14,
            alloc_throttle_enabled: true,
            alloc_initial_queue_depth: 32,
            alloc_max_queue_depth: 100,
            max_disabled_per_group: 3,
            slop_shift: 5,
            autotrim: false,
            debug_load: false,
            debug_unload: false,
            debug_verify: cfg!(debug_assertions),
            unflushed_max_mem_ppm: 1000,
            unflushed_log_txg_max: 64,
            min_metaslabs_to_flush: 1,
        }
    }
}

impl Tunables {
    pub fn from_yaml(s: &str) -> Result<Self> {
        let t: Tunables = serde_yaml_ng::from_str(s)?;
        t.validate()?;
        Ok(t)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Memory that loaded free-space indexes may occupy, in bytes
    pub fn mem_limit(&self) -> u64 {
        self.system_memory / 100 * self.mem_limit_pct
    }

    /// Memory that unflushed log changes may occupy, in bytes
    pub fn unflushed_mem_limit(&self) -> u64 {
        self.system_memory / 1_000_000 * self.unflushed_max_mem_ppm
    }

    pub fn validate(&self) -> Result<()> {
        if self.condense_pct < 100 ||
            self.mem_limit_pct > 100 ||
            self.preload_threads == 0 ||
            self.size_index_floor_shift >= 64 ||
            self.ndf_clump_shift >= 32 ||
            self.group_fragmentation_threshold > 100 ||
            self.fragmentation_threshold > 100 ||
            self.alloc_initial_queue_depth == 0 ||
            self.alloc_initial_queue_depth > self.alloc_max_queue_depth ||
            self.max_disabled_per_group == 0 ||
            self.slop_shift >= 64
        {
            Err(Error::EINVAL)
        } else {
            Ok(())
        }
    }
}

/// Shared, live-adjustable `Tunables`
#[derive(Debug)]
pub struct TunablesHandle(RwLock<Arc<Tunables>>);

impl TunablesHandle {
    pub fn new(t: Tunables) -> Self {
        TunablesHandle(RwLock::new(Arc::new(t)))
    }

    /// Take a snapshot of the current values
    pub fn load(&self) -> Arc<Tunables> {
        self.0.read().unwrap().clone()
    }

    /// Replace all values at once
    pub fn store(&self, t: Tunables) -> Result<()> {
        t.validate()?;
        *self.0.write().unwrap() = Arc::new(t);
        Ok(())
    }

    /// Modify some values, leaving the rest alone
    pub fn update<F>(&self, f: F) -> Result<()>
        where F: FnOnce(&mut Tunables)
    {
        let mut t = Tunables::clone(&self.load());
        f(&mut t);
        self.store(t)
    }
}

impl Default for TunablesHandle {
    fn default() -> Self {
        TunablesHandle::new(Tunables::default())
    }
}

// LCOV_EXCL_STOP
