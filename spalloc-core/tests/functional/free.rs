// vim: tw=80
//! Freeing blocks
use pretty_assertions::assert_eq;
use std::thread;
use spalloc_core::{
    types::*,
    vdev::ClassKind,
};

use crate::{PoolBuilder, PoolHarness};

fn alloc(h: &PoolHarness, psize: u64, txg: TxgT) -> BlockPtr {
    t!(h.pool.alloc(ClassKind::Normal, psize, 1, None, txg,
                    AllocFlags::DONT_THROTTLE, 0))
}

/// A block freed in the txg that allocated it may be undone immediately, but
/// only once.
#[test]
fn unalloc_twice() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let bp = alloc(&h, 8192, txg);
    let dva = bp.dvas[0];
    let id = dva.offset >> 20;
    let before = t!(h.pool.free_segments(0, id)).unwrap();
    t!(h.pool.free(&bp, txg, true));
    assert_eq!(Err(Error::ENOENT), h.pool.free(&bp, txg, true));
    let after = t!(h.pool.free_segments(0, id)).unwrap();
    let freed: u64 = after.iter().map(|(s, e)| e - s).sum::<u64>() -
        before.iter().map(|(s, e)| e - s).sum::<u64>();
    assert_eq!(freed, 8192);
    let summary = t!(h.pool.space_summary(0, id)).unwrap();
    assert_eq!(summary.allocating, 0);
    assert_eq!(summary.total(), 1 << 20);
}

/// Immediate frees are only possible within the allocating txg
#[test]
fn unalloc_wrong_txg() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let bp = alloc(&h, 4096, txg);
    assert_eq!(Err(Error::ENOENT), h.pool.free(&bp, txg + 1, true));
    h.sync_range(TXG_INITIAL, txg);
    assert_eq!(Err(Error::ENOENT), h.pool.free(&bp, txg, true));
}

/// A block freed in txg T isn't allocatable until T + TXG_DEFER_SIZE syncs
#[test]
fn deferred_visibility() {
    let h = PoolBuilder::new()
        .vdev_size(4 << 20)
        .build();
    let t0 = TXG_INITIAL + 1;
    let bp = alloc(&h, 1 << 20, t0);
    let id = bp.dvas[0].offset >> 20;
    h.sync_range(TXG_INITIAL, t0);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 1 << 20);

    let tfree = t0 + 1;
    t!(h.pool.free(&bp, tfree, false));
    for i in 0..TXG_DEFER_SIZE as u64 {
        h.sync(tfree + i);
        assert_eq!(t!(h.pool.free_segments(0, id)), Some(Vec::new()),
                   "freed space visible after txg {}", tfree + i);
        let info = t!(h.pool.metaslab_info(0, id));
        assert_eq!(info.deferred, 1 << 20);
        // Deferred space still counts as allocated
        assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 1 << 20);
    }
    h.sync(tfree + TXG_DEFER_SIZE as u64);
    assert_eq!(t!(h.pool.free_segments(0, id)),
               Some(vec![(id << 20, (id + 1) << 20)]));
    assert_eq!(t!(h.pool.metaslab_info(0, id)).deferred, 0);
    let stats = h.pool.class_stats(ClassKind::Normal);
    assert_eq!(stats.alloc, 0);
    assert_eq!(stats.deferred, 0);
}

/// Freeing a DVA that doesn't fit within one metaslab is rejected
#[test]
fn free_straddling() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let bp = BlockPtr {
        dvas: vec![Dva::new(0, (1 << 20) - 4096, 8192)],
        birth: txg
    };
    assert_eq!(Err(Error::EINVAL), h.pool.free(&bp, txg, false));
}

/// Claiming a block that's already free succeeds once, then fails
#[test]
fn claim() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let bp = BlockPtr {
        dvas: vec![Dva::new(0, 3 << 20, 65536)],
        birth: TXG_INITIAL
    };
    t!(h.pool.load_metaslab(0, 3));
    t!(h.pool.claim(&bp, txg));
    assert_eq!(Err(Error::ENOENT), h.pool.claim(&bp, txg));
    let free = t!(h.pool.free_segments(0, 3)).unwrap();
    assert_eq!(free, vec![((3 << 20) + 65536, 4 << 20)]);
    h.sync_range(TXG_INITIAL, txg);
    assert_eq!(t!(h.pool.metaslab_info(0, 3)).allocated, 65536);
}

/// With autotrim, space becomes trimmable once its deferral ends
#[test]
fn trim() {
    let h = PoolBuilder::new()
        .tunables(|t| t.autotrim = true)
        .build();
    let t0 = TXG_INITIAL + 1;
    let bp = alloc(&h, 8192, t0);
    let dva = bp.dvas[0];
    let id = dva.offset >> 20;
    h.sync_range(TXG_INITIAL, t0);
    let tfree = t0 + 1;
    t!(h.pool.free(&bp, tfree, false));
    h.sync_range(tfree, tfree + TXG_DEFER_SIZE as u64 - 1);
    assert_eq!(t!(h.pool.trim_metaslab(0, id, |_, _| ())), 0);

    h.sync(tfree + TXG_DEFER_SIZE as u64);
    let mut ranges = Vec::new();
    let trimmed = t!(h.pool.trim_metaslab(0, id, |s, l| ranges.push((s, l))));
    assert_eq!(trimmed, 8192);
    assert_eq!(ranges, vec![(dva.offset, 8192)]);
    // Each range is handed over only once
    assert_eq!(t!(h.pool.trim_metaslab(0, id, |_, _| ())), 0);
}

/// Without autotrim, nothing accumulates
#[test]
fn trim_disabled() {
    let h = PoolBuilder::new().build();
    let t0 = TXG_INITIAL + 1;
    let bp = alloc(&h, 8192, t0);
    let id = bp.dvas[0].offset >> 20;
    h.sync_range(TXG_INITIAL, t0);
    t!(h.pool.free(&bp, t0 + 1, false));
    h.sync_range(t0 + 1, t0 + 1 + TXG_DEFER_SIZE as u64);
    assert_eq!(t!(h.pool.trim_metaslab(0, id, |_, _| ())), 0);
}

/// A block freed in a later txg than the metaslab's next sync stays out of
/// circulation for the full deferral after its own txg.
#[test]
fn free_in_later_txg() {
    let h = PoolBuilder::new().build();
    let t0 = TXG_INITIAL + 1;
    let a = alloc(&h, 8192, t0);
    h.sync_range(TXG_INITIAL, t0);
    let dva = a.dvas[0];
    let id = dva.offset >> 20;
    let visible = || {
        t!(h.pool.free_segments(0, id)).unwrap().iter()
            .any(|&(s, e)| s <= dva.offset && dva.offset < e)
    };

    let b = alloc(&h, 8192, t0 + 1);
    assert_eq!(b.dvas[0].offset >> 20, id);
    let tfree = t0 + 2;
    t!(h.pool.free(&a, tfree, false));
    h.sync(t0 + 1);
    assert_eq!(t!(h.pool.metaslab_info(0, id)).allocated, 16384);
    assert_eq!(t!(h.pool.metaslab_info(0, id)).deferred, 0);
    for txg in tfree.0..tfree.0 + TXG_DEFER_SIZE as u64 {
        h.sync(TxgT(txg));
        assert!(!visible(), "freed space visible after txg {txg}");
    }
    h.sync(tfree + TXG_DEFER_SIZE as u64);
    assert!(visible());
    assert_eq!(t!(h.pool.metaslab_info(0, id)).allocated, 8192);
}

/// Freeing a block twice is an error, not a crash, in the same txg or later
#[test]
fn double_free() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    let txg = TXG_INITIAL + 1;
    let bp = t!(h.pool.alloc(ClassKind::Normal, 8192, 2, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    h.sync_range(TXG_INITIAL, txg);
    t!(h.pool.free(&bp, txg + 1, false));
    assert_eq!(Err(Error::ENOENT), h.pool.free(&bp, txg + 1, false));
    h.sync(txg + 1);
    assert_eq!(Err(Error::ENOENT), h.pool.free(&bp, txg + 2, false));
    h.sync_range(txg + 2, txg + 1 + TXG_DEFER_SIZE as u64);
    let stats = h.pool.class_stats(ClassKind::Normal);
    assert_eq!(stats.alloc, 0);
    assert_eq!(stats.deferred, 0);
}

/// Frees for the next txg may race with syncing the current one.  Afterwards
/// the space maps agree with the in-core trees.
#[test]
fn free_during_sync() {
    let h = PoolBuilder::new().build();
    let t0 = TXG_INITIAL + 1;
    let old = (0..64).map(|_| alloc(&h, 4096, t0)).collect::<Vec<_>>();
    h.sync_range(TXG_INITIAL, t0);
    let t1 = t0 + 1;
    let young = (0..64).map(|_| alloc(&h, 4096, t1)).collect::<Vec<_>>();
    thread::scope(|s| {
        s.spawn(|| h.sync(t1));
        s.spawn(|| {
            for bp in old.iter() {
                t!(h.pool.free(bp, t1 + 1, false));
            }
        });
    });
    h.sync_range(t1 + 1, t1 + 1 + TXG_DEFER_SIZE as u64);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 64 * 4096);

    let mut ids = young.iter()
        .chain(old.iter())
        .map(|bp| bp.dvas[0].offset >> 20)
        .collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();
    let before = ids.iter()
        .map(|&id| {
            t!(h.pool.load_metaslab(0, id));
            t!(h.pool.free_segments(0, id))
        })
        .collect::<Vec<_>>();
    let h = h.reopen();
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 64 * 4096);
    for (&id, segs) in ids.iter().zip(before.iter()) {
        t!(h.pool.load_metaslab(0, id));
        assert_eq!(&t!(h.pool.free_segments(0, id)), segs);
    }
}
