// vim: tw=80
//! Metaslab weights and ranking
//!
//! A metaslab's weight estimates how useful it would be to allocate from.  It
//! comes in two flavors: space-based weights count free bytes, and
//! segment-based weights name the largest power-of-two bucket of the free
//! space histogram that isn't empty, plus the number of segments in it.

use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
};
use crate::{
    space_map::fold_histogram,
    tunables::Tunables,
    types::*,
    util::highbit64,
};

/// Fragmentation metric by size class, starting at `SPA_MINBLOCKSIZE`.
/// Free space in tiny segments counts as fully fragmented.
const FRAGMENTATION_TABLE: [u64; 16] = [
    100,    // 512B
    100,    // 1K
    98,     // 2K
    95,     // 4K
    90,     // 8K
    80,     // 16K
    70,     // 32K
    60,     // 64K
    50,     // 128K
    40,     // 256K
    30,     // 512K
    20,     // 1M
    15,     // 2M
    10,     // 4M
    5,      // 8M
    0       // 16M
];

/// Largest count that a segment weight can carry
const SEGMENT_COUNT_MAX: u64 = (1 << 54) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Weight {
    /// Free bytes, possibly scaled for fragmentation and location
    Space(u64),
    /// `count` free segments in the bucket `[2^index, 2^(index + 1))`
    Segment {
        index: u8,
        count: u64
    }
}

impl Weight {
    pub const ZERO: Weight = Weight::Space(0);

    pub fn is_zero(&self) -> bool {
        match self {
            Weight::Space(s) => *s == 0,
            Weight::Segment{count, ..} => *count == 0
        }
    }

    pub fn is_space_based(&self) -> bool {
        matches!(self, Weight::Space(_))
    }

    pub fn segment(index: u32, count: u64) -> Self {
        Weight::Segment {
            index: index as u8,
            count: count.min(SEGMENT_COUNT_MAX)
        }
    }

    /// Bucket index of a segment-based weight
    pub fn index(&self) -> Option<u32> {
        match self {
            Weight::Segment{index, ..} => Some(u32::from(*index)),
            Weight::Space(_) => None
        }
    }

    /// Could a metaslab with this weight possibly satisfy an allocation of
    /// `asize` bytes?
    pub fn may_fit(&self, asize: u64) -> bool {
        match self {
            Weight::Space(s) => asize <= *s,
            Weight::Segment{index, count} => *count > 0 &&
                u128::from(asize) < 1u128 << (u32::from(*index) + 1),
        }
    }

    fn key(&self) -> (u8, u64, u64) {
        match self {
            _ if self.is_zero() => (0, 0, 0),
            Weight::Segment{index, count} => (1, u64::from(*index), *count),
            Weight::Space(s) => (2, *s, 0),
        }
    }
}

impl Default for Weight {
    fn default() -> Self {
        Weight::ZERO
    }
}

/// Zero sorts lowest, then every segment-based weight, then every space-based
/// one.
impl Ord for Weight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Weight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Weight {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Weight::Space(s) => write!(f, "{s}"),
            Weight::Segment{index, count} => write!(f, "{count}x2^{index}")
        }
    }
}

/// How a metaslab is currently activated
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Activation {
    #[default]
    Inactive,
    Primary,
    Secondary,
    /// Activated only to replay a claim.  Holds no allocator slot.
    Claim
}

impl Activation {
    pub fn is_active(self) -> bool {
        self != Activation::Inactive
    }

    /// Does this activation occupy one of an allocator's two slots?
    pub fn has_slot(self) -> bool {
        matches!(self, Activation::Primary | Activation::Secondary)
    }

    fn sort(self) -> u8 {
        match self {
            Activation::Inactive | Activation::Claim => 0,
            Activation::Primary => 1,
            Activation::Secondary => 2,
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Activation::Inactive => "-",
            Activation::Primary => "P",
            Activation::Secondary => "S",
            Activation::Claim => "C",
        };
        f.pad(s)
    }
}

/// A metaslab's position in its group's ranking.
///
/// Inactive metaslabs come first, then primaries, then secondaries.  Within
/// each, heavier metaslabs come first, and ties go to the lower offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RankKey {
    sort: u8,
    pub weight: Weight,
    pub start: u64,
    pub id: u64,
}

impl RankKey {
    pub fn new(activation: Activation, weight: Weight, start: u64, id: u64)
        -> Self
    {
        RankKey{sort: activation.sort(), weight, start, id}
    }

    /// Is this metaslab active as some allocator's primary or secondary?
    pub fn is_slotted(&self) -> bool {
        self.sort != 0
    }

    /// The smallest key that sorts after every key sharing this one's
    /// activation class, weight, and start.
    pub fn successor(&self) -> Self {
        RankKey{start: self.start + 1, id: 0, ..*self}
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort.cmp(&other.sort)
            .then_with(|| other.weight.cmp(&self.weight))
            .then_with(|| self.start.cmp(&other.start))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fragmentation percentage of a space map's free space.
pub fn fragmentation(histogram: &[u64; SPACE_MAP_HISTOGRAM_SIZE], shift: u32)
    -> u64
{
    let mut total = 0u128;
    let mut frag = 0u128;
    for (i, &count) in histogram.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let idx = (shift as usize + i).saturating_sub(SPA_MINBLOCKSHIFT as usize)
            .min(FRAGMENTATION_TABLE.len() - 1);
        let space = u128::from(count) << (i + shift as usize);
        total += space;
        frag += space * u128::from(FRAGMENTATION_TABLE[idx]);
    }
    if total > 0 {
        (frag / total) as u64
    } else {
        0
    }
}

/// Weight based on free bytes.
///
/// On rotational media, metaslabs closer to the start of the device are
/// worth up to twice as much, since they're faster.
pub fn space_weight(free: u64, frag: Option<u64>, id: u64, ms_count: u64,
                    nonrot: bool, tunables: &Tunables) -> Weight
{
    let mut space = free;
    if let Some(frag) = frag.filter(|_| tunables.fragmentation_factor_enabled)
    {
        space = (u128::from(space) * u128::from(101 - frag.min(100)) / 100)
            as u64;
        if space > 0 && space < SPA_MINBLOCKSIZE {
            space = SPA_MINBLOCKSIZE;
        }
    }
    if !nonrot && tunables.lba_weighting_enabled && ms_count > 0 {
        let w = u128::from(space);
        space = (2 * w - u128::from(id) * w / u128::from(ms_count)) as u64;
    }
    Weight::Space(space)
}

/// Segment weight of a metaslab that is completely free
pub fn segment_weight_empty(ms_size: u64, ashift: u32) -> Weight {
    let idx = highbit64(ms_size) - 1;
    let max_idx = SPACE_MAP_HISTOGRAM_SIZE as u32 + ashift - 1;
    if idx < max_idx {
        Weight::segment(idx, 1)
    } else {
        Weight::segment(max_idx, 1 << (idx - max_idx).min(53))
    }
}

/// Segment weight from a loaded metaslab's free space histogram.
///
/// Buckets too large to be represented by a space map are folded into the
/// largest one that is, so loaded and unloaded weights stay comparable.
pub fn segment_weight_from_range_tree(
    histogram: &[u64; RANGE_TREE_HISTOGRAM_SIZE], ashift: u32) -> Weight
{
    let max_idx = SPACE_MAP_HISTOGRAM_SIZE + ashift as usize - 1;
    let mut segments = 0u64;
    for i in (SPA_MINBLOCKSHIFT as usize..RANGE_TREE_HISTOGRAM_SIZE).rev() {
        segments = segments.saturating_mul(2).saturating_add(histogram[i]);
        if i > max_idx {
            continue;
        }
        if segments != 0 {
            return Weight::segment(i as u32, segments);
        }
    }
    Weight::ZERO
}

/// Segment weight from an unloaded metaslab's space map histogram.
///
/// Deferred frees are recorded in the space map but can't be allocated yet, so
/// they are subtracted out.
pub fn segment_weight_from_space_map(
    histogram: &[u64; SPACE_MAP_HISTOGRAM_SIZE], shift: u32,
    deferred: &[&[u64; RANGE_TREE_HISTOGRAM_SIZE]]) -> Weight
{
    let mut defer_hist = [0u64; SPACE_MAP_HISTOGRAM_SIZE];
    for h in deferred {
        fold_histogram(shift, h, &mut defer_hist);
    }
    for i in (0..SPACE_MAP_HISTOGRAM_SIZE).rev() {
        let count = histogram[i].saturating_sub(defer_hist[i]);
        if count != 0 {
            return Weight::segment(i as u32 + shift, count);
        }
    }
    Weight::ZERO
}

// LCOV_EXCL_STOP
