// vim: tw=80
//! Device and storage faults
use pretty_assertions::assert_eq;
use spalloc_core::{
    metaslab::LoadState,
    types::*,
    vdev::{ClassKind, Health},
};

use crate::PoolBuilder;

/// A space map read error aborts the load, leaving the metaslab unloaded
/// and loadable later.
#[test_log::test]
fn load_eio() {
    let h = PoolBuilder::new().build();
    let txg = TXG_INITIAL + 1;
    let bp = t!(h.pool.alloc(ClassKind::Normal, 65536, 1, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    let id = bp.dvas[0].offset >> 20;
    h.sync_range(TXG_INITIAL, txg);
    let h = h.reopen();
    assert_eq!(t!(h.pool.metaslab_info(0, id)).state, LoadState::Unloaded);

    h.store.fail_reads(true);
    assert_eq!(Err(Error::EIO), h.pool.load_metaslab(0, id));
    let info = t!(h.pool.metaslab_info(0, id));
    assert_eq!(info.state, LoadState::Unloaded);
    assert_eq!(info.allocated, 65536);

    h.store.fail_reads(false);
    t!(h.pool.load_metaslab(0, id));
    let info = t!(h.pool.metaslab_info(0, id));
    assert_eq!(info.state, LoadState::Loaded);
    assert_eq!(info.free, Some((1 << 20) - 65536));
}

/// Metaslabs without space maps need no reads to load
#[test_log::test]
fn load_empty_without_reads() {
    let h = PoolBuilder::new().build();
    h.store.fail_reads(true);
    t!(h.pool.load_metaslab(0, 5));
    assert_eq!(t!(h.pool.metaslab_info(0, 5)).free, Some(1 << 20));
}

/// Nothing is allocated from a faulted device
#[test_log::test]
fn faulted_vdev() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    let txg = TXG_INITIAL + 1;
    t!(h.pool.set_health(0, Health::Faulted));
    for _ in 0..32 {
        let bp = t!(h.pool.alloc(ClassKind::Normal, 65536, 1, None, txg,
                                 AllocFlags::DONT_THROTTLE, 0));
        assert_eq!(bp.dvas[0].vdev, 1);
    }
    t!(h.pool.set_health(0, Health::Online));
    let bp = t!(h.pool.alloc(ClassKind::Normal, 65536, 2, None, txg,
                             AllocFlags::DONT_THROTTLE, 0));
    assert_ne!(bp.dvas[0].vdev, bp.dvas[1].vdev);
}

/// A device's health survives reopening the pool
#[test_log::test]
fn health_persists() {
    let h = PoolBuilder::new()
        .disks(2)
        .build();
    t!(h.pool.set_health(1, Health::Faulted));
    h.sync(TXG_INITIAL);
    let h = h.reopen();
    assert_eq!(t!(h.pool.group(1)).health(), Health::Faulted);
    assert_eq!(t!(h.pool.group(0)).health(), Health::Online);
}
