// vim: tw=80
//! Pool checkpoints
use pretty_assertions::assert_eq;
use spalloc_core::{
    types::*,
    vdev::ClassKind,
};

use crate::PoolBuilder;

/// Space freed after a checkpoint stays allocated until the checkpoint is
/// discarded.
#[test]
fn hold_and_discard() {
    let h = PoolBuilder::new().build();
    let t0 = TXG_INITIAL + 1;
    let old = t!(h.pool.alloc(ClassKind::Normal, 65536, 1, None, t0,
                              AllocFlags::DONT_THROTTLE, 0));
    h.sync_range(TXG_INITIAL, t0);
    t!(h.pool.checkpoint(t0));

    let t1 = t0 + 1;
    let young = t!(h.pool.alloc(ClassKind::Normal, 8192, 1, None, t1,
                                AllocFlags::DONT_THROTTLE, 0));
    h.sync(t1);
    let t2 = t1 + 1;
    t!(h.pool.free(&old, t2, false));
    t!(h.pool.free(&young, t2, false));
    h.sync_range(t2, t2 + TXG_DEFER_SIZE as u64);
    // Only the block born after the checkpoint came back
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 65536);
    let dva = old.dvas[0];
    let id = dva.offset >> 20;
    let free = t!(h.pool.free_segments(0, id)).unwrap();
    assert!(free.iter().all(|&(s, e)| e <= dva.offset ||
                                      s >= dva.offset + dva.asize));

    let h = h.reopen();
    assert_eq!(h.pool.checkpoint_txg(), Some(t0));
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 65536);

    let td = t2 + TXG_DEFER_SIZE as u64 + 1;
    t!(h.pool.discard_checkpoint(td));
    assert_eq!(h.pool.checkpoint_txg(), None);
    h.sync_range(td, td + TXG_DEFER_SIZE as u64);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 0);
    t!(h.pool.load_metaslab(0, id));
    assert_eq!(t!(h.pool.free_segments(0, id)).unwrap(),
               vec![(id << 20, (id + 1) << 20)]);
}

/// Blocks born after the checkpoint are freed normally
#[test]
fn young_blocks() {
    let h = PoolBuilder::new().build();
    t!(h.pool.checkpoint(TXG_INITIAL));
    let t1 = TXG_INITIAL + 1;
    let bp = t!(h.pool.alloc(ClassKind::Normal, 4096, 1, None, t1,
                             AllocFlags::DONT_THROTTLE, 0));
    h.sync_range(TXG_INITIAL, t1);
    let t2 = t1 + 1;
    t!(h.pool.free(&bp, t2, false));
    h.sync_range(t2, t2 + TXG_DEFER_SIZE as u64);
    assert_eq!(h.pool.class_stats(ClassKind::Normal).alloc, 0);
}
