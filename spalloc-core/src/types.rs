// vim: tw=80
//! Common type definitions used throughout spalloc

use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{Add, AddAssign, BitOr, BitOrAssign, Sub},
};

/// Identifies a top-level device within the pool.
pub type VdevT = u32;

/// Identifies an object within the `ObjectStore`.  Zero is never a valid
/// object.
pub type ObjectT = u64;

/// Number of transaction groups whose allocations may be in flight at once.
pub const TXG_SIZE: usize = 4;
pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;
/// Open, quiescing, and syncing
pub const TXG_CONCURRENT_STATES: u64 = 3;
/// Number of txgs for which freed space is withheld from reuse
pub const TXG_DEFER_SIZE: usize = 2;
/// The first txg of a freshly created pool
pub const TXG_INITIAL: TxgT = TxgT(TXG_SIZE as u64);

pub const SPA_MINBLOCKSHIFT: u32 = 9;
pub const SPA_MINBLOCKSIZE: u64 = 1 << SPA_MINBLOCKSHIFT;
pub const SPA_MAXBLOCKSHIFT: u32 = 24;
pub const SPA_MAXBLOCKSIZE: u64 = 1 << SPA_MAXBLOCKSHIFT;
/// The largest block size before large-block support.
pub const SPA_OLD_MAXBLOCKSIZE: u64 = 128 * 1024;

/// Buckets in the in-core range tree's histogram: one per power of two.
pub const RANGE_TREE_HISTOGRAM_SIZE: usize = 64;
/// Buckets in a persisted space map's histogram.  The first bucket holds
/// segments of `1 << shift` bytes.
pub const SPACE_MAP_HISTOGRAM_SIZE: usize = 32;

/// spalloc's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    // Standard errnos
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Directory not empty")]
    ENOTEMPTY       = libc::ENOTEMPTY as isize,

    //// spalloc custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
    #[error("Integrity check failed")]
    EINTEGRITY      = 257,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EIO)
    }
}

impl From<bincode::Error> for Error {
    fn from(_: bincode::Error) -> Self {
        Error::EINTEGRITY
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(_: serde_yaml_ng::Error) -> Self {
        Error::EINVAL
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap_or(libc::EIO)
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Transaction group numbers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u64);

impl TxgT {
    /// Index of this txg's slot in a `TXG_SIZE`-long per-txg array
    pub fn slot(self) -> usize {
        (self.0 & TXG_MASK) as usize
    }

    /// Index of this txg's slot in the `TXG_DEFER_SIZE`-long defer ring
    pub fn defer_slot(self) -> usize {
        (self.0 % TXG_DEFER_SIZE as u64) as usize
    }
}

impl Add<u64> for TxgT {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u64> for TxgT {
    fn add_assign(&mut self, rhs: u64) {
        *self = TxgT(self.0 + rhs)
    }
}

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Sub<u64> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        TxgT(self.0.saturating_sub(rhs))
    }
}

impl Display for TxgT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Data Virtual Address.
///
/// Locates one copy of a block: a byte range within one top-level device.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, Ord,
         PartialEq, PartialOrd)]
pub struct Dva {
    pub vdev: VdevT,
    pub offset: u64,
    /// Allocated size, after rounding to the device's block size
    pub asize: u64,
    /// Set if this copy is a gang header
    pub gang: bool,
}

impl Dva {
    pub fn new(vdev: VdevT, offset: u64, asize: u64) -> Self {
        Dva{vdev, offset, asize, gang: false}
    }
}

impl Display for Dva {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "<{}:{:#x}:{:#x}>", self.vdev, self.offset, self.asize)
    }
}

/// Block pointer: all copies of one block, plus the txg it was born in.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct BlockPtr {
    pub dvas: Vec<Dva>,
    pub birth: TxgT,
}

/// Options recognized by the allocation path.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Use the hint's device, then move on to the next one
    pub const HINTBP_AVOID: AllocFlags = AllocFlags(1 << 0);
    /// This allocation is a gang header
    pub const GANG_HEADER: AllocFlags = AllocFlags(1 << 1);
    /// This allocation is a gang member.  Relaxes the throttle.
    pub const GANG_CHILD: AllocFlags = AllocFlags(1 << 2);
    /// Reserve throttle slots even past the class limit
    pub const MUST_RESERVE: AllocFlags = AllocFlags(1 << 3);
    /// Bypass both throttle admission and group queue-depth gating
    pub const DONT_THROTTLE: AllocFlags = AllocFlags(1 << 4);
    /// Intent-log allocation: advance the rotor after every block
    pub const ZIL: AllocFlags = AllocFlags(1 << 5);

    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        AllocFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// LCOV_EXCL_STOP
