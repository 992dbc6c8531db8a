// vim: tw=80
//! Adding and removing devices
use pretty_assertions::assert_eq;
use spalloc_core::{
    types::*,
    vdev::{ClassKind, VdevConfig},
};

use crate::PoolBuilder;

/// A new device's space isn't usable until its first txg syncs
#[test]
fn add() {
    let h = PoolBuilder::new().build();
    h.sync(TXG_INITIAL);
    let txg = TXG_INITIAL + 1;
    let vdev = t!(h.pool.add_vdev(VdevConfig::new(8 << 20).ms_shift(20), txg));
    assert_eq!(vdev, 1);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).space, 16 << 20);
    h.sync(txg);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).space, 24 << 20);
    assert_eq!(h.pool.groups().len(), 2);
}

/// Devices with allocated space can't be removed
#[test]
fn remove_busy() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    let txg = TXG_INITIAL + 1;
    let bp = t!(h.pool.alloc(ClassKind::Normal, 4096, 2, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    h.sync_range(TXG_INITIAL, txg);
    assert_eq!(Err(Error::EBUSY), h.pool.remove_vdev(bp.dvas[0].vdev));
    // The device is still in service
    let bp2 = t!(h.pool.alloc(ClassKind::Normal, 4096, 2, None, txg + 1,
                              AllocFlags::DONT_THROTTLE, 0));
    assert_ne!(bp2.dvas[0].vdev, bp2.dvas[1].vdev);
}

/// An empty device can be removed, and its id is never reused
#[test]
fn remove_empty() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    h.sync(TXG_INITIAL);
    let objects_before = h.store.inner.object_count();
    t!(h.pool.remove_vdev(1));
    assert_eq!(Err(Error::ENXIO), h.pool.group(1).map(drop));
    assert_eq!(h.pool.class_stats(ClassKind::Normal).space, 16 << 20);
    assert!(h.store.inner.object_count() < objects_before);

    let txg = TXG_INITIAL + 1;
    for _ in 0..8 {
        let bp = t!(h.pool.alloc(ClassKind::Normal, 65536, 1, None, txg,
                                 AllocFlags::DONT_THROTTLE, 0));
        assert_eq!(bp.dvas[0].vdev, 0);
    }
    let vdev = t!(h.pool.add_vdev(VdevConfig::new(8 << 20).ms_shift(20), txg));
    assert_eq!(vdev, 2);
    h.sync(txg);
    let h = h.reopen();
    let vdevs = h.pool.groups().iter().map(|g| g.vdev()).collect::<Vec<_>>();
    assert_eq!(vdevs, vec![0, 2]);
}

/// Space on a device that was freed, then fully drained, permits removal
#[test]
fn remove_after_free() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    let txg = TXG_INITIAL + 1;
    let bp = t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    h.sync_range(TXG_INITIAL, txg);
    let vdev = bp.dvas[0].vdev;
    t!(h.pool.free(&bp, txg + 1, false));
    h.sync_range(txg + 1, txg + 1 + TXG_DEFER_SIZE as u64);
    t!(h.pool.remove_vdev(vdev));
    assert_eq!(h.pool.groups().len(), 1);
}
