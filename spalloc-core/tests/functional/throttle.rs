// vim: tw=80
//! The allocation throttle
use pretty_assertions::assert_eq;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
};
use spalloc_core::{
    types::*,
    vdev::ClassKind,
};

use crate::PoolBuilder;

/// Concurrent reservations never exceed the class's slot limit
#[test]
fn reservation_bound() {
    let h = PoolBuilder::new()
        .disks(2)
        .tunables(|t| t.alloc_max_queue_depth = 50)
        .build();
    let granted = AtomicU64::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..60 {
                    if h.pool.reserve(ClassKind::Normal, 1, 0, AllocFlags::NONE)
                    {
                        granted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    // Two groups of 50 slots each
    assert_eq!(granted.load(Ordering::Relaxed), 100);
    assert!(!h.pool.reserve(ClassKind::Normal, 1, 0, AllocFlags::NONE));
    assert!(h.pool.reserve(ClassKind::Normal, 1, 0, AllocFlags::MUST_RESERVE));
    h.pool.unreserve(ClassKind::Normal, 101, 0);
    assert!(h.pool.reserve(ClassKind::Normal, 100, 0, AllocFlags::NONE));
}

/// Each allocator has its own reservations
#[test]
fn per_allocator() {
    let h = PoolBuilder::new()
        .allocators(2)
        .tunables(|t| t.alloc_max_queue_depth = 10)
        .build();
    assert!(h.pool.reserve(ClassKind::Normal, 10, 0, AllocFlags::NONE));
    assert!(!h.pool.reserve(ClassKind::Normal, 1, 0, AllocFlags::NONE));
    assert!(h.pool.reserve(ClassKind::Normal, 10, 1, AllocFlags::NONE));
}

/// Throttled allocations spread out once a group's queue is full
#[test]
fn queue_depth_spreads() {
    let h = PoolBuilder::new()
        .disks(2)
        .tunables(|t| {
            t.alloc_initial_queue_depth = 4;
            t.alloc_max_queue_depth = 8;
            t.aliquot = 16 << 20;
        }).build();
    let txg = TXG_INITIAL + 1;
    let bps = (0..8).map(|_| {
        t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, txg,
                        AllocFlags::NONE, 0))
    }).collect::<Vec<_>>();
    let on0 = bps.iter().filter(|bp| bp.dvas[0].vdev == 0).count();
    assert_eq!(on0, 4);
    for bp in bps.iter() {
        t!(h.pool.alloc_done(bp, 0, AllocFlags::NONE, true));
    }
    for vdev in 0..2 {
        let stats = t!(h.pool.group(vdev)).stats();
        assert_eq!(stats.allocations, 4);
    }
}
