// vim: tw=80
//! Block allocation strategies
//!
//! Each strategy picks an offset for a new allocation from a metaslab's free
//! space tree.  Strategies never modify the tree itself; the caller removes the
//! chosen range.  They may, however, update the metaslab's cursors.

use enum_dispatch::enum_dispatch;
use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use crate::{
    range_tree::RangeTree,
    tunables::Tunables,
    util::{highbit64, lowbit64},
};

/// Number of per-metaslab cursors
pub const MAX_LBAS: usize = 64;

/// Everything a strategy may look at or update
pub struct StrategyArgs<'a> {
    /// The metaslab's free space
    pub tree: &'a mut RangeTree,
    pub cursors: &'a mut [u64; MAX_LBAS],
    pub ms_start: u64,
    pub ms_size: u64,
    pub tunables: &'a Tunables,
}

#[enum_dispatch]
pub trait AllocStrategyApi {
    /// Choose an offset for `size` bytes, or `None` if nothing fits
    fn alloc(&self, args: &mut StrategyArgs, size: u64) -> Option<u64>;

    fn kind(&self) -> StrategyKind;
}

/// Scan forward from a cursor for the first segment that fits, giving up after
/// `max_search` bytes and at least `min_search_count` segments.
fn block_picker(tree: &RangeTree, cursor: &mut u64, start: u64, size: u64,
                max_search: u64, min_search_count: u64) -> Option<u64>
{
    if *cursor == 0 {
        *cursor = start;
    }
    let mut first_found = None;
    for (count, (s, e)) in tree.iter_from(*cursor).enumerate() {
        let first = *first_found.get_or_insert(s);
        if s - first > max_search && count as u64 >= min_search_count {
            break;
        }
        if s + size <= e {
            *cursor = s + size;
            return Some(s);
        }
    }
    *cursor = 0;
    None
}

/// Cursor-driven first fit, switching to best fit when space gets tight.
///
/// There is one cursor per alignment class, so that allocations of similar
/// alignment tend to land next to each other.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicFit;

impl AllocStrategyApi for DynamicFit {
    fn alloc(&self, args: &mut StrategyArgs, size: u64) -> Option<u64> {
        let t = args.tunables;
        let max_size = args.tree.largest().map(|(_, l)| l).unwrap_or(0);
        if max_size < size {
            return None;
        }
        let cidx = lowbit64(size) as usize - 1;
        let free_pct = args.tree.space() * 100 / args.ms_size;
        let mut offset = None;
        if max_size >= t.df_alloc_threshold && free_pct >= t.df_free_pct {
            offset = block_picker(args.tree, &mut args.cursors[cidx],
                args.ms_start, size, t.df_max_search, t.min_search_count);
        }
        if offset.is_none() {
            let seg = if t.df_use_largest_segment {
                args.tree.largest()
            } else {
                args.tree.find_at_least(size)
            };
            if let Some((s, _)) = seg.filter(|&(_, l)| l >= size) {
                offset = Some(s);
                args.cursors[cidx] = s + size;
            }
        }
        offset
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::DynamicFit
    }
}

/// Carve allocations sequentially out of the largest free segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct CursorFit;

impl AllocStrategyApi for CursorFit {
    fn alloc(&self, args: &mut StrategyArgs, size: u64) -> Option<u64> {
        let cursor = args.cursors[0];
        let cursor_end = args.cursors[1];
        if cursor + size > cursor_end || !args.tree.contains(cursor, size) {
            let (s, l) = args.tree.largest()?;
            if l < size {
                return None;
            }
            args.cursors[0] = s;
            args.cursors[1] = s + l;
        }
        let offset = args.cursors[0];
        args.cursors[0] += size;
        Some(offset)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::CursorFit
    }
}

/// Reuse the last position for this size class if it still fits.  Otherwise
/// take the smallest segment that is a few size classes larger than the
/// request, or the largest segment if none is.
#[derive(Clone, Copy, Debug, Default)]
pub struct NewDynamicFit;

impl AllocStrategyApi for NewDynamicFit {
    fn alloc(&self, args: &mut StrategyArgs, size: u64) -> Option<u64> {
        let hbit = highbit64(size);
        let cidx = hbit as usize - 1;
        let max_size = args.tree.largest().map(|(_, l)| l).unwrap_or(0);
        if max_size < size {
            return None;
        }
        let cursor = args.cursors[cidx];
        let near = args.tree.iter_from(cursor)
            .next()
            .filter(|&(s, _)| s < cursor + size)
            .filter(|&(s, e)| e - s >= size);
        let (s, l) = match near {
            Some((s, e)) => (s, e - s),
            None => {
                let clump_shift = hbit + args.tunables.ndf_clump_shift;
                let clump = 1u64.checked_shl(clump_shift).unwrap_or(u64::MAX);
                args.tree.find_at_least(max_size.min(clump))?
            }
        };
        if l >= size {
            args.cursors[cidx] = s + size;
            Some(s)
        } else {
            None
        }
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::NewDynamicFit
    }
}

#[enum_dispatch(AllocStrategyApi)]
#[derive(Clone, Copy, Debug)]
pub enum AllocStrategy {
    DynamicFit,
    CursorFit,
    NewDynamicFit,
}

impl From<StrategyKind> for AllocStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::DynamicFit => DynamicFit.into(),
            StrategyKind::CursorFit => CursorFit.into(),
            StrategyKind::NewDynamicFit => NewDynamicFit.into(),
        }
    }
}

/// Persistent name of an allocation strategy
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    DynamicFit,
    CursorFit,
    NewDynamicFit,
}

impl Display for StrategyKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            StrategyKind::DynamicFit => "df",
            StrategyKind::CursorFit => "cf",
            StrategyKind::NewDynamicFit => "ndf",
        };
        f.pad(s)
    }
}

// LCOV_EXCL_STOP
