// vim: tw=80
//! Persisting and reloading allocator state
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest::rstest;
use rstest_reuse::{apply, template};
use std::sync::Arc;
use spalloc_core::{
    metaslab::LoadState,
    object_store::MemStore,
    pool::Pool,
    types::*,
    vdev::ClassKind,
};

use crate::{PoolBuilder, PoolHarness};

const MS_COUNT: u64 = 16;

/// Allocate and free a seeded mix of blocks over several txgs, then let every
/// deferred free drain.  Returns the next unused txg.
fn churn(h: &PoolHarness, seed: u64) -> TxgT {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut live: Vec<BlockPtr> = Vec::new();
    let mut txg = TXG_INITIAL;
    h.sync(txg);
    for _ in 0..8 {
        txg += 1;
        for _ in 0..24 {
            let psize = 512u64 << rng.gen_range(0..7);
            let bp = t!(h.pool.alloc(ClassKind::Normal, psize, 1, None, txg,
                                     AllocFlags::DONT_THROTTLE, 0));
            live.push(bp);
        }
        for _ in 0..8 {
            let idx = rng.gen_range(0..live.len());
            if live[idx].birth < txg {
                let bp = live.swap_remove(idx);
                t!(h.pool.free(&bp, txg, false));
            }
        }
        h.sync(txg);
    }
    for _ in 0..TXG_DEFER_SIZE {
        txg += 1;
        h.sync(txg);
    }
    txg + 1
}

/// The free segments of every metaslab, loading each one first
fn snapshot(pool: &Pool) -> Vec<Vec<(u64, u64)>> {
    (0..MS_COUNT).map(|id| {
        t!(pool.load_metaslab(0, id));
        t!(pool.free_segments(0, id)).unwrap()
    }).collect()
}

#[template]
#[rstest(log_enabled,
         case(false),    // Each metaslab appends to its own space map
         case(true),     // Changes go to the pool-wide log first
)]
fn both_logs(log_enabled: bool) {}

/// Unloading and reloading a metaslab reproduces its free space index
#[apply(both_logs)]
fn unload_reload(log_enabled: bool) {
    let h = PoolBuilder::new()
        .log_enabled(log_enabled)
        .build();
    churn(&h, 42);
    for id in 0..MS_COUNT {
        t!(h.pool.load_metaslab(0, id));
        let before = t!(h.pool.free_segments(0, id)).unwrap();
        t!(h.pool.unload_metaslab(0, id));
        assert_eq!(t!(h.pool.metaslab_info(0, id)).state, LoadState::Unloaded);
        assert_eq!(t!(h.pool.free_segments(0, id)), None);
        t!(h.pool.load_metaslab(0, id));
        let after = t!(h.pool.free_segments(0, id)).unwrap();
        assert_eq!(before, after, "metaslab {id}");
    }
}

/// A reopened pool has the same free space as before
#[apply(both_logs)]
fn reopen(log_enabled: bool) {
    let h = PoolBuilder::new()
        .log_enabled(log_enabled)
        .build();
    let txg = churn(&h, 7);
    let alloc = h.pool.class_stats(ClassKind::Normal).alloc;
    let before = snapshot(&h.pool);

    let h = h.reopen();
    assert_eq!(h.pool.synced_txg(), txg - 1);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, alloc);
    assert_eq!(snapshot(&h.pool), before);

    // The reopened pool keeps working
    let bp = t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    h.sync(txg);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, alloc + 4096);
    let id = bp.dvas[0].offset >> 20;
    let info = t!(h.pool.metaslab_info(0, id));
    assert!(info.sm_object.is_some());
}

/// Exporting folds the whole log into the metaslabs' own space maps
#[test]
fn export() {
    let h = PoolBuilder::new()
        .log_enabled(true)
        .build();
    let txg = churn(&h, 99);
    let before = snapshot(&h.pool);
    t!(h.pool.export(txg));
    let h = h.reopen();
    assert_eq!(h.pool.synced_txg(), txg);
    assert_eq!(snapshot(&h.pool), before);
}

/// A pool survives being saved to a file and loaded back
#[test]
fn save_to_file() {
    let h = PoolBuilder::new().build();
    let txg = churn(&h, 1234);
    let before = snapshot(&h.pool);
    let tempdir = t!(tempfile::Builder::new()
        .prefix("spalloc_functional_test")
        .tempdir());
    let path = tempdir.path().join("pool.bin");
    t!(h.store.inner.save(&path));
    drop(h.pool);

    let store = t!(MemStore::open(&path));
    let pool = t!(Pool::open(Arc::new(store), h.tunables.clone()));
    assert_eq!(pool.synced_txg(), txg - 1);
    assert_eq!(snapshot(&pool), before);
}

/// Opening a store that holds no pool fails
#[test]
fn open_empty() {
    let store = Arc::new(MemStore::new());
    let h = PoolBuilder::new().build();
    assert_eq!(Err(Error::ENOENT),
        Pool::open(store, h.tunables.clone()).map(drop));
}

/// Newly added devices are remembered
#[test]
fn reopen_added_vdev() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let config = spalloc_core::vdev::VdevConfig::new(8 << 20).ms_shift(20);
    let vdev = t!(h.pool.add_vdev(config, txg));
    h.sync_range(TXG_INITIAL, txg);
    let h = h.reopen();
    let group = t!(h.pool.group(vdev));
    assert_eq!(group.config().asize, 8 << 20);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).space, 24 << 20);
}
