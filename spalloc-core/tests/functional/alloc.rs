// vim: tw=80
//! Allocation from whole pools
use itertools::Itertools;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use spalloc_core::{
    types::*,
    vdev::ClassKind,
};

use crate::{PoolBuilder, PoolHarness};

fn alloc(h: &PoolHarness, psize: u64, ndvas: usize, txg: TxgT) -> BlockPtr {
    t!(h.pool.alloc(ClassKind::Normal, psize, ndvas, None, txg,
                    AllocFlags::DONT_THROTTLE, 0))
}

/// Check that no two outstanding DVAs overlap, and that none of them lies in
/// a loaded metaslab's free space index.
fn check_disjoint(h: &PoolHarness, outstanding: &[Dva], ms_count: u64) {
    for (a, b) in outstanding.iter()
        .sorted_by_key(|d| (d.vdev, d.offset))
        .tuple_windows()
    {
        assert!(a.vdev != b.vdev || a.offset + a.asize <= b.offset,
                "{a} overlaps {b}");
    }
    for group in h.pool.groups() {
        let vdev = group.vdev();
        for id in 0..ms_count {
            let Some(free) = t!(h.pool.free_segments(vdev, id)) else {
                continue;
            };
            for dva in outstanding.iter().filter(|d| d.vdev == vdev) {
                let end = dva.offset + dva.asize;
                assert!(free.iter().all(|&(s, e)| end <= s || dva.offset >= e),
                        "{dva} is in the free space index");
            }
        }
    }
}

/// Every loaded metaslab's space is fully accounted for
fn check_conservation(h: &PoolHarness, ms_count: u64, ms_size: u64) {
    for group in h.pool.groups() {
        for id in 0..ms_count {
            if let Some(summary) = t!(h.pool.space_summary(group.vdev(), id)) {
                assert_eq!(summary.total(), ms_size,
                    "vdev {} metaslab {}: {:?}", group.vdev(), id, summary);
            }
        }
    }
}

/// A seeded workload of allocations and deferred frees.  Space is always
/// conserved, and nothing is ever allocated twice.
#[test]
fn conservation_and_disjointness() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    let mut rng = XorShiftRng::seed_from_u64(0xdead_beef);
    let mut live: Vec<BlockPtr> = Vec::new();
    // Freed blocks, and the txg that freed them
    let mut deferred: Vec<(TxgT, BlockPtr)> = Vec::new();
    let first = TXG_INITIAL + 1;
    for i in 0..24 {
        let txg = first + i;
        for _ in 0..32 {
            let psize = 512u64 << rng.gen_range(0..8);
            let ndvas = rng.gen_range(1..=2);
            live.push(alloc(&h, psize, ndvas, txg));
        }
        for _ in 0..12 {
            let idx = rng.gen_range(0..live.len());
            if live[idx].birth < txg {
                let bp = live.swap_remove(idx);
                t!(h.pool.free(&bp, txg, false));
                deferred.push((txg, bp));
            }
        }
        h.sync(txg);
        deferred.retain(|(freed, _)| *freed + TXG_DEFER_SIZE as u64 > txg);

        check_conservation(&h, 16, 1 << 20);
        let outstanding = live.iter()
            .chain(deferred.iter().map(|(_, bp)| bp))
            .flat_map(|bp| bp.dvas.iter().copied())
            .collect::<Vec<_>>();
        check_disjoint(&h, &outstanding, 16);
    }
}

/// The copies of one block land on different devices when possible
#[test]
fn ditto_copies() {
    let h = PoolBuilder::new()
        .disks(3)
        .build();
    let txg = TXG_INITIAL + 1;
    for _ in 0..16 {
        let bp = alloc(&h, 8192, 3, txg);
        let vdevs = bp.dvas.iter().map(|d| d.vdev).unique().count();
        assert_eq!(vdevs, 3);
    }
}

/// A 1 MiB request exactly fills an empty 1 MiB metaslab
#[test]
fn exact_fit() {
    let h = PoolBuilder::new()
        .vdev_size(4 << 20)
        .build();
    let txg = TXG_INITIAL + 1;
    let bp = alloc(&h, 1 << 20, 1, txg);
    let dva = bp.dvas[0];
    assert_eq!(dva.offset % (1 << 20), 0);
    assert_eq!(dva.asize, 1 << 20);
    let id = dva.offset >> 20;
    assert_eq!(t!(h.pool.free_segments(0, id)), Some(Vec::new()));
    let summary = t!(h.pool.space_summary(0, id)).unwrap();
    assert_eq!(summary.allocating, 1 << 20);
    assert_eq!(summary.allocatable, 0);
}

/// A request too big for any metaslab fails without consuming anything
#[test]
fn too_big() {
    let h = PoolBuilder::new()
        .vdev_size(4 << 20)
        .build();
    let txg = TXG_INITIAL + 1;
    assert_eq!(Err(Error::ENOSPC),
        h.pool.alloc(ClassKind::Normal, 2 << 20, 1, None, txg,
                     AllocFlags::DONT_THROTTLE, 0));
    // Whole metaslabs remain available
    for _ in 0..4 {
        alloc(&h, 1 << 20, 1, txg);
    }
}

/// With equal devices, small allocations fill one aliquot on each device in
/// turn.
#[test]
fn rotor_fairness() {
    let h = PoolBuilder::new()
        .disks(3)
        .tunables(|t| {
            t.aliquot = 64 << 10;
            t.bias_enabled = false;
        }).build();
    let txg = TXG_INITIAL + 1;
    let vdevs = (0..12)
        .map(|_| alloc(&h, 32 << 10, 1, txg).dvas[0].vdev)
        .collect::<Vec<_>>();
    let first = vdevs[0];
    let expected = (0..12u32).map(|i| (first + i / 2) % 3).collect::<Vec<_>>();
    assert_eq!(vdevs, expected);
    let counts = vdevs.iter().counts();
    assert!(counts.values().all(|&c| c == 4));
}

/// Each allocator gets its own primary metaslab
#[test]
fn allocators_dont_share() {
    let h = PoolBuilder::new()
        .allocators(2)
        .build();
    let txg = TXG_INITIAL + 1;
    let a = t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, txg,
                            AllocFlags::DONT_THROTTLE, 0));
    let b = t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, txg,
                            AllocFlags::DONT_THROTTLE, 1));
    assert_ne!(a.dvas[0].offset >> 20, b.dvas[0].offset >> 20);
}

/// Allocations of the special class never land on normal devices
#[test]
fn special_class() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let config = spalloc_core::vdev::VdevConfig::new(8 << 20)
        .ms_shift(20)
        .class(ClassKind::Special);
    let special = t!(h.pool.add_vdev(config, TXG_INITIAL));
    h.sync(TXG_INITIAL);
    for _ in 0..8 {
        let bp = t!(h.pool.alloc(ClassKind::Special, 4096, 1, None, txg,
                                 AllocFlags::DONT_THROTTLE, 0));
        assert_eq!(bp.dvas[0].vdev, special);
    }
    assert_eq!(h.pool.class_stats(ClassKind::Special).space, 8 << 20);
}
