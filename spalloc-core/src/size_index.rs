// vim: tw=80
//! Size-ordered index of a `RangeTree`'s segments

use std::collections::BTreeSet;

/// Index of free segments ordered by size, then by offset.
///
/// Segments smaller than `1 << floor_shift` are left out of the index, to
/// bound its memory use.  Consumers that need those small segments must fall
/// back to scanning the range tree itself.
#[derive(Clone, Debug)]
pub struct SizeIndex {
    /// (size, start) pairs
    set: BTreeSet<(u64, u64)>,
    floor_shift: u32,
}

impl SizeIndex {
    pub fn new(floor_shift: u32) -> Self {
        SizeIndex {
            set: BTreeSet::new(),
            floor_shift,
        }
    }

    fn floor(&self) -> u64 {
        1u64 << self.floor_shift
    }

    pub fn floor_shift(&self) -> u32 {
        self.floor_shift
    }

    pub fn add(&mut self, start: u64, size: u64) {
        if size >= self.floor() {
            self.set.insert((size, start));
        }
    }

    pub fn remove(&mut self, start: u64, size: u64) {
        self.set.remove(&(size, start));
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// The largest indexed segment as `(start, size)`
    pub fn largest(&self) -> Option<(u64, u64)> {
        self.set.iter().next_back().map(|&(size, start)| (start, size))
    }

    /// The smallest indexed segment at least `size` bytes long, lowest offset
    /// first among equals, as `(start, size)`.
    pub fn find_at_least(&self, size: u64) -> Option<(u64, u64)> {
        self.set.range((size, 0)..).next().map(|&(size, start)| (start, size))
    }

    pub fn vacate(&mut self) {
        self.set.clear();
    }

    /// Rebuild the index from scratch.  The floor still applies.
    pub fn full_load<I>(&mut self, segs: I)
        where I: IntoIterator<Item=(u64, u64)>
    {
        let floor = self.floor();
        self.set.clear();
        self.set.extend(segs.into_iter()
            .filter(|&(_, size)| size >= floor)
            .map(|(start, size)| (size, start)));
    }
}

// LCOV_EXCL_STOP
