// vim: tw=80
//! Condensing space maps, and choosing metaslabs without loading them
use pretty_assertions::assert_eq;
use spalloc_core::{
    metaslab::LoadState,
    object_store::ObjectStore,
    types::*,
    weight::Weight,
};

use crate::{PoolBuilder, PoolHarness};

/// Claim `count` blocks of `size` bytes in metaslab 0, leaving a gap of
/// `gap` bytes after each one.
fn claim_pattern(h: &PoolHarness, count: u64, size: u64, gap: u64, txg: TxgT)
    -> Vec<BlockPtr>
{
    t!(h.pool.load_metaslab(0, 0));
    (0..count).map(|i| {
        let bp = BlockPtr {
            dvas: vec![Dva::new(0, i * (size + gap), size)],
            birth: txg
        };
        t!(h.pool.claim(&bp, txg));
        bp
    }).collect()
}

/// With space-based weights, a condensed metaslab is never ranked lower than
/// before.
#[test]
fn weight_monotonic() {
    let h = PoolBuilder::new()
        .tunables(|t| t.segment_weight_enabled = false)
        .build();
    let t0 = TXG_INITIAL + 1;
    let bps = claim_pattern(&h, 128, 4096, 4096, t0);
    h.sync_range(TXG_INITIAL, t0);
    let tfree = t0 + 1;
    for bp in bps.iter().step_by(2) {
        t!(h.pool.free(bp, tfree, false));
    }
    h.sync_range(tfree, tfree + TXG_DEFER_SIZE as u64);

    let before = t!(h.pool.metaslab_info(0, 0));
    assert!(before.weight.is_space_based());
    let free_before = t!(h.pool.free_segments(0, 0)).unwrap();

    let tc = tfree + TXG_DEFER_SIZE as u64 + 1;
    t!(h.pool.condense_metaslab(0, 0, tc));
    h.sync(tc);

    let after = t!(h.pool.metaslab_info(0, 0));
    assert!(after.weight >= before.weight,
            "weight fell from {} to {}", before.weight, after.weight);
    assert_eq!(after.allocated, before.allocated);
    assert_eq!(t!(h.pool.free_segments(0, 0)).unwrap(), free_before);

    // The condensed space map still describes the same free space
    t!(h.pool.unload_metaslab(0, 0));
    t!(h.pool.load_metaslab(0, 0));
    assert_eq!(t!(h.pool.free_segments(0, 0)).unwrap(), free_before);
}

/// Condensing a space map full of churn makes it no bigger
#[test]
fn condense_shrinks() {
    let h = PoolBuilder::new().build();
    let t0 = TXG_INITIAL + 1;
    let bps = claim_pattern(&h, 64, 8192, 8192, t0);
    h.sync_range(TXG_INITIAL, t0);
    let mut txg = t0 + 1;
    // Free and reclaim the same blocks repeatedly, growing the space map
    for _ in 0..4 {
        for bp in bps.iter() {
            t!(h.pool.free(bp, txg, false));
        }
        h.sync_range(txg, txg + TXG_DEFER_SIZE as u64);
        txg += TXG_DEFER_SIZE as u64 + 1;
        for bp in bps.iter() {
            t!(h.pool.claim(bp, txg));
        }
        h.sync(txg);
        txg += 1;
    }
    let before = t!(h.pool.metaslab_info(0, 0));
    let sm = before.sm_object.unwrap();
    let len_before = t!(h.store.len(sm));
    t!(h.pool.condense_metaslab(0, 0, txg));
    h.sync(txg);
    let after = t!(h.pool.metaslab_info(0, 0));
    let len_after = t!(h.store.len(after.sm_object.unwrap()));
    assert!(len_after < len_before, "{len_after} >= {len_before}");
    assert_eq!(after.allocated, 64 * 8192);
}

/// A metaslab whose free segments are all too small is rejected without
/// being loaded.
#[test]
fn should_allocate_fragmented() {
    let h = PoolBuilder::new()
        .tunables(|t| t.max_size_cache_sec = 0)
        .build();
    let t0 = TXG_INITIAL + 1;
    claim_pattern(&h, 64, 8192, 8192, t0);
    h.sync_range(TXG_INITIAL, t0);
    let free = t!(h.pool.free_segments(0, 0)).unwrap();
    assert!(free.iter().all(|(s, e)| e - s == 8192));
    t!(h.pool.unload_metaslab(0, 0));

    let info = t!(h.pool.metaslab_info(0, 0));
    assert_eq!(info.weight, Weight::segment(13, 64));
    assert!(!t!(h.pool.should_allocate(0, 0, 16384)));
    assert!(t!(h.pool.should_allocate(0, 0, 8192)));
    assert!(t!(h.pool.should_allocate(0, 0, 4096)));
    assert_eq!(t!(h.pool.metaslab_info(0, 0)).state, LoadState::Unloaded);
    // An empty metaslab accepts anything that fits
    assert!(t!(h.pool.should_allocate(0, 1, 1 << 20)));
}
