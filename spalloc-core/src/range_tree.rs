// vim: tw=80
//! In-core sets of byte ranges
//!
//! A `RangeTree` holds disjoint, coalesced `[start, end)` segments.  Adjacent
//! segments are always merged.  Adding a range that overlaps an existing
//! segment, or removing one that isn't wholly present, is a bug in the caller
//! and panics.

use std::{
    cmp,
    collections::BTreeMap,
    mem,
    ops::Bound,
};
use crate::{
    size_index::SizeIndex,
    types::*,
    util::highbit64
};

/// Approximate in-core cost of one segment, for memory accounting
pub const SEGMENT_MEM: u64 = 64;

#[derive(Clone, Debug)]
pub struct RangeTree {
    /// Maps segment start to segment end
    segs: BTreeMap<u64, u64>,
    space: u64,
    histogram: [u64; RANGE_TREE_HISTOGRAM_SIZE],
    by_size: Option<SizeIndex>,
}

impl Default for RangeTree {
    fn default() -> Self {
        RangeTree {
            segs: BTreeMap::new(),
            space: 0,
            histogram: [0; RANGE_TREE_HISTOGRAM_SIZE],
            by_size: None,
        }
    }
}

fn bucket(size: u64) -> usize {
    highbit64(size) as usize - 1
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tree that also maintains a size index
    pub fn with_size_index(floor_shift: u32) -> Self {
        RangeTree {
            by_size: Some(SizeIndex::new(floor_shift)),
            ..Default::default()
        }
    }

    fn seg_added(&mut self, start: u64, size: u64) {
        self.histogram[bucket(size)] += 1;
        if let Some(si) = self.by_size.as_mut() {
            si.add(start, size);
        }
    }

    fn seg_removed(&mut self, start: u64, size: u64) {
        let b = bucket(size);
        debug_assert!(self.histogram[b] > 0);
        self.histogram[b] -= 1;
        if let Some(si) = self.by_size.as_mut() {
            si.remove(start, size);
        }
    }

    fn insert_seg(&mut self, start: u64, end: u64) {
        self.segs.insert(start, end);
        self.seg_added(start, end - start);
    }

    fn delete_seg(&mut self, start: u64) -> u64 {
        let end = self.segs.remove(&start)
            .expect("deleting a segment that doesn't exist");
        self.seg_removed(start, end - start);
        end
    }

    /// The segment with the highest start that is `<= offset`
    fn seg_at_or_before(&self, offset: u64) -> Option<(u64, u64)> {
        self.segs.range(..=offset).next_back().map(|(&s, &e)| (s, e))
    }

    /// The segment with the lowest start that is `> offset`
    fn seg_after(&self, offset: u64) -> Option<(u64, u64)> {
        self.segs.range((Bound::Excluded(offset), Bound::Unbounded))
            .next()
            .map(|(&s, &e)| (s, e))
    }

    /// Add `[start, start + size)`, which must not overlap anything already
    /// present.
    pub fn add(&mut self, start: u64, size: u64) {
        assert!(size > 0, "adding an empty range");
        let end = start + size;
        let before = self.seg_at_or_before(start);
        if let Some((s, e)) = before {
            assert!(e <= start,
                "adding segment [{start:#x}, {end:#x}) overlaps \
                 [{s:#x}, {e:#x})");
        }
        let after = self.seg_after(start);
        if let Some((s, _)) = after {
            assert!(s >= end,
                "adding segment [{start:#x}, {end:#x}) overlaps one at {s:#x}");
        }
        let merge_before = before.filter(|&(_, e)| e == start);
        let merge_after = after.filter(|&(s, _)| s == end);
        let mut new_start = start;
        let mut new_end = end;
        if let Some((s, _)) = merge_before {
            self.delete_seg(s);
            new_start = s;
        }
        if let Some((s, e)) = merge_after {
            self.delete_seg(s);
            new_end = e;
        }
        self.insert_seg(new_start, new_end);
        self.space += size;
    }

    /// Remove `[start, start + size)`, which must be wholly present.
    pub fn remove(&mut self, start: u64, size: u64) {
        assert!(size > 0, "removing an empty range");
        let end = start + size;
        let (s, e) = self.seg_at_or_before(start)
            .filter(|&(_, e)| e >= end)
            .unwrap_or_else(|| panic!(
                "removing segment [{start:#x}, {end:#x}) not completely \
                 present"));
        self.delete_seg(s);
        if s < start {
            self.insert_seg(s, start);
        }
        if end < e {
            self.insert_seg(end, e);
        }
        self.space -= size;
    }

    /// Remove whatever parts of `[start, start + size)` are present.
    pub fn clear(&mut self, start: u64, size: u64) {
        let end = start + size;
        let overlaps = self.overlapping(start, end);
        for (s, e) in overlaps {
            let os = cmp::max(s, start);
            let oe = cmp::min(e, end);
            self.remove(os, oe - os);
        }
    }

    /// All segments that overlap `[start, end)`, as `(start, end)`
    fn overlapping(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let first = self.seg_at_or_before(start)
            .filter(|&(_, e)| e > start)
            .map(|(s, _)| s)
            .unwrap_or(start);
        self.segs.range(first..end)
            .map(|(&s, &e)| (s, e))
            .collect()
    }

    /// Is all of `[start, start + size)` present?
    pub fn contains(&self, start: u64, size: u64) -> bool {
        self.seg_at_or_before(start)
            .map(|(_, e)| e >= start + size)
            .unwrap_or(false)
    }

    /// Is any part of `[start, start + size)` present?
    pub fn intersects(&self, start: u64, size: u64) -> bool {
        let end = start + size;
        self.seg_at_or_before(start).map(|(_, e)| e > start).unwrap_or(false) ||
            self.segs.range(start..end).next().is_some()
    }

    /// The lowest part of `[start, start + size)` that is present, as
    /// `(start, size)`
    pub fn find_in(&self, start: u64, size: u64) -> Option<(u64, u64)> {
        let end = start + size;
        self.overlapping(start, end).first().map(|&(s, e)| {
            let os = cmp::max(s, start);
            (os, cmp::min(e, end) - os)
        })
    }

    /// The segment that contains `offset`, as `(start, end)`
    pub fn find_containing(&self, offset: u64) -> Option<(u64, u64)> {
        self.seg_at_or_before(offset).filter(|&(_, e)| e > offset)
    }

    /// Iterate over segments as `(start, end)`, in offset order.
    pub fn iter(&self) -> impl Iterator<Item=(u64, u64)> + '_ {
        self.segs.iter().map(|(&s, &e)| (s, e))
    }

    /// Iterate over segments beginning with the one containing `cursor`, or
    /// else the first one after it.
    pub fn iter_from(&self, cursor: u64)
        -> impl Iterator<Item=(u64, u64)> + '_
    {
        let first = self.find_containing(cursor)
            .map(|(s, _)| s)
            .unwrap_or(cursor);
        self.segs.range(first..).map(|(&s, &e)| (s, e))
    }

    /// Call `f(start, size)` for every segment
    pub fn walk<F: FnMut(u64, u64)>(&self, mut f: F) {
        for (&s, &e) in self.segs.iter() {
            f(s, e - s);
        }
    }

    /// Add every segment of `other` to `self`
    pub fn add_tree(&mut self, other: &RangeTree) {
        other.walk(|s, size| self.add(s, size));
    }

    /// Remove every segment of `other` from `self`
    pub fn remove_tree(&mut self, other: &RangeTree) {
        other.walk(|s, size| self.remove(s, size));
    }

    /// Empty the tree, discarding its contents
    pub fn vacate(&mut self) {
        self.segs.clear();
        self.space = 0;
        self.histogram = [0; RANGE_TREE_HISTOGRAM_SIZE];
        if let Some(si) = self.by_size.as_mut() {
            si.vacate();
        }
    }

    /// Empty the tree, adding its contents to `dst`
    pub fn vacate_into(&mut self, dst: &mut RangeTree) {
        dst.add_tree(self);
        self.vacate();
    }

    /// Exchange contents with `other`.  Any size indexes are exchanged too.
    pub fn swap(&mut self, other: &mut RangeTree) {
        mem::swap(self, other);
    }

    /// For every part of `[start, end)`: if it is present in `removefrom`,
    /// remove it from there.  Otherwise, add it to `addto`.
    pub fn remove_xor_add_segment(start: u64, end: u64,
        removefrom: &mut RangeTree, addto: &mut RangeTree)
    {
        let mut cur = start;
        for (s, e) in removefrom.overlapping(start, end) {
            let os = cmp::max(s, start);
            let oe = cmp::min(e, end);
            if os > cur {
                addto.add(cur, os - cur);
            }
            removefrom.remove(os, oe - os);
            cur = oe;
        }
        if cur < end {
            addto.add(cur, end - cur);
        }
    }

    /// Apply `remove_xor_add_segment` to each of `self`'s segments
    pub fn remove_xor_add(&self, removefrom: &mut RangeTree,
        addto: &mut RangeTree)
    {
        for (s, e) in self.iter() {
            RangeTree::remove_xor_add_segment(s, e, removefrom, addto);
        }
    }

    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn numsegs(&self) -> u64 {
        self.segs.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Count of segments by power-of-two size class
    pub fn histogram(&self) -> &[u64; RANGE_TREE_HISTOGRAM_SIZE] {
        &self.histogram
    }

    /// The lowest segment, as `(start, end)`
    pub fn first(&self) -> Option<(u64, u64)> {
        self.segs.iter().next().map(|(&s, &e)| (s, e))
    }

    /// Approximate in-core memory used, in bytes
    pub fn mem_used(&self) -> u64 {
        let idx = self.by_size.as_ref().map(|si| si.len() as u64).unwrap_or(0);
        (self.numsegs() + idx) * SEGMENT_MEM
    }

    /// Current floor of the size index, if there is one
    pub fn size_index_floor_shift(&self) -> Option<u32> {
        self.by_size.as_ref().map(SizeIndex::floor_shift)
    }

    /// Populate an empty size index from the tree, if the tree isn't empty.
    fn size_index_reload(&mut self) {
        if let Some(si) = self.by_size.as_mut() {
            if si.is_empty() && !self.segs.is_empty() {
                si.full_load(self.segs.iter().map(|(&s, &e)| (s, e - s)));
            }
        }
    }

    /// The largest segment, as `(start, size)`
    pub fn largest(&mut self) -> Option<(u64, u64)> {
        self.size_index_reload();
        match self.by_size.as_ref() {
            Some(si) => si.largest().or_else(|| self.largest_linear()),
            None => self.largest_linear()
        }
    }

    fn largest_linear(&self) -> Option<(u64, u64)> {
        self.segs.iter()
            .map(|(&s, &e)| (s, e - s))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }

    /// The smallest segment at least `size` bytes long, as `(start, size)`
    pub fn find_at_least(&mut self, size: u64) -> Option<(u64, u64)> {
        self.size_index_reload();
        let floor = self.by_size.as_ref()
            .map(|si| 1u64 << si.floor_shift());
        match (self.by_size.as_ref(), floor) {
            (Some(si), Some(floor)) => {
                si.find_at_least(size).or_else(|| {
                    if size < floor {
                        self.find_at_least_linear(size)
                    } else {
                        None
                    }
                })
            }
            _ => self.find_at_least_linear(size)
        }
    }

    fn find_at_least_linear(&self, size: u64) -> Option<(u64, u64)> {
        self.segs.iter()
            .map(|(&s, &e)| (s, e - s))
            .filter(|&(_, l)| l >= size)
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }
}

// LCOV_EXCL_STOP
