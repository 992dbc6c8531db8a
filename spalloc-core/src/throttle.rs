// vim: tw=80
//! Allocation throttle
//!
//! Two levels of admission control bound the number of allocations in flight.
//! Each class limits the number of reserved slots per allocator, and each group
//! tracks how many allocations are queued to it, steering new allocations away
//! from groups whose queue is already full.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use crate::types::*;

#[derive(Debug, Default)]
struct GroupQueue {
    /// Allocations handed out but not yet completed
    depth: AtomicU64,
    /// Current limit.  Grows by one for every completed allocation, up to the
    /// group maximum.
    cur_max: AtomicU64,
}

/// One group's per-allocator queue depths
#[derive(Debug)]
pub struct GroupThrottle {
    queues: Vec<GroupQueue>,
    max: u64,
}

impl GroupThrottle {
    pub fn new(allocators: usize, initial: u64, max: u64) -> Self {
        let queues = (0..allocators).map(|_| GroupQueue {
            depth: AtomicU64::new(0),
            cur_max: AtomicU64::new(initial),
        }).collect();
        GroupThrottle{queues, max}
    }

    pub fn depth(&self, allocator: usize) -> u64 {
        self.queues[allocator].depth.load(Ordering::Relaxed)
    }

    pub fn cur_max(&self, allocator: usize) -> u64 {
        self.queues[allocator].cur_max.load(Ordering::Relaxed)
    }

    /// Largest depth that each allocator's limit may reach
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Is this allocator's queue below its current limit?
    pub fn has_room(&self, allocator: usize) -> bool {
        self.depth(allocator) < self.cur_max(allocator)
    }

    pub fn increment(&self, allocator: usize) {
        self.queues[allocator].depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire one queued allocation.  If its I/O has completed, the group has
    /// shown that it can keep up, so raise its limit.
    pub fn decrement(&self, allocator: usize, io_complete: bool) {
        let q = &self.queues[allocator];
        let r = q.depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed,
            |d| d.checked_sub(1));
        assert!(r.is_ok(), "group queue depth underflow");
        if io_complete {
            let max = self.max;
            let _ = q.cur_max.fetch_update(Ordering::Relaxed, Ordering::Relaxed,
                |cur| (cur < max).then_some(cur + 1));
        }
    }

    /// Restore every allocator's limit to its initial value
    pub fn reset(&self, initial: u64) {
        for q in self.queues.iter() {
            q.cur_max.store(initial.min(self.max), Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
struct AllocSlots {
    reserved: AtomicU64,
    max: AtomicU64,
}

/// One class's per-allocator reservation slots
#[derive(Debug)]
pub struct ClassThrottle {
    slots: Vec<AllocSlots>,
}

impl ClassThrottle {
    pub fn new(allocators: usize) -> Self {
        ClassThrottle {
            slots: (0..allocators).map(|_| AllocSlots::default()).collect()
        }
    }

    pub fn reserved(&self, allocator: usize) -> u64 {
        self.slots[allocator].reserved.load(Ordering::Relaxed)
    }

    pub fn max_slots(&self, allocator: usize) -> u64 {
        self.slots[allocator].max.load(Ordering::Relaxed)
    }

    /// Adjust every allocator's limit when a group joins or leaves the class
    pub fn add_max(&self, delta: i64) {
        for s in self.slots.iter() {
            if delta >= 0 {
                s.max.fetch_add(delta as u64, Ordering::Relaxed);
            } else {
                s.max.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
            }
        }
    }

    /// Try to reserve `count` slots.
    ///
    /// Gang members and `MUST_RESERVE` allocations always succeed, even past
    /// the limit, since they're needed to finish allocations already admitted.
    pub fn reserve(&self, count: u64, allocator: usize, flags: AllocFlags)
        -> bool
    {
        let s = &self.slots[allocator];
        let force = flags.contains(AllocFlags::GANG_CHILD) ||
            flags.contains(AllocFlags::GANG_HEADER) ||
            flags.contains(AllocFlags::MUST_RESERVE);
        let max = s.max.load(Ordering::Relaxed);
        s.reserved.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
            (force || r + count <= max).then_some(r + count)
        }).is_ok()
    }

    pub fn unreserve(&self, count: u64, allocator: usize) {
        let r = self.slots[allocator].reserved.fetch_update(Ordering::AcqRel,
            Ordering::Acquire, |r| r.checked_sub(count));
        if r.is_err() {
            warn!(allocator, count, "unreserving more slots than reserved");
            self.slots[allocator].reserved.store(0, Ordering::Release);
        }
    }
}

// LCOV_EXCL_STOP
