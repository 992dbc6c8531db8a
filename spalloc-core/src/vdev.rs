// vim: tw=80
//! Top-level device geometry and health

use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    num::NonZeroU8
};
use crate::{
    types::*,
    util::highbit64
};

/// Metaslabs are this big unless that would make too many or too few.
const DEFAULT_MS_SHIFT: u32 = 29;
const DEFAULT_MS_COUNT: u64 = 200;
const MIN_MS_COUNT: u64 = 16;
const MAX_MS_SHIFT: u32 = 34;
const MS_COUNT_LIMIT: u64 = 1 << 17;

/// The ordering reflects which Health is "sicker".  That is, a degraded vdev is
/// sicker than an online one, a doubly-degraded vdev is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, PartialOrd,
         Ord, Serialize)]
pub enum Health {
    /// Perfectly healthy
    #[default]
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// Rebuild in progress.  Not all data is present.
    Rebuilding,
    /// Faulted.  No I/O is possible
    Faulted,
}

impl Health {
    /// If this vdev is degraded, how many levels of redundancy is it missing?
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        if let Health::Degraded(d) = self {
            Some(d)
        } else {
            None
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Rebuilding => "Rebuilding".fmt(f),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Which allocation class a device serves
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    /// General purpose data
    #[default]
    Normal,
    /// Small blocks and metadata
    Special,
    /// Intent log blocks
    Log,
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassKind::Normal => "normal",
            ClassKind::Special => "special",
            ClassKind::Log => "log",
        };
        f.pad(s)
    }
}

/// Fixed geometry of one top-level device
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VdevConfig {
    /// Allocatable size in bytes
    pub asize: u64,
    /// log2 of the smallest allocatable unit
    pub ashift: u32,
    /// log2 of the metaslab size
    pub ms_shift: u32,
    /// Solid state media.  Disables location-based weighting.
    pub nonrot: bool,
    pub class: ClassKind,
}

impl VdevConfig {
    /// Describe a device, choosing a metaslab size that yields a reasonable
    /// number of metaslabs.
    pub fn new(asize: u64) -> Self {
        let ms_count = asize >> DEFAULT_MS_SHIFT;
        let mut ms_shift = if ms_count < MIN_MS_COUNT {
            highbit64(asize / MIN_MS_COUNT)
        } else if ms_count > DEFAULT_MS_COUNT {
            highbit64(asize / DEFAULT_MS_COUNT)
        } else {
            DEFAULT_MS_SHIFT
        };
        ms_shift = ms_shift.clamp(SPA_MAXBLOCKSHIFT, MAX_MS_SHIFT);
        if (asize >> ms_shift) > MS_COUNT_LIMIT {
            ms_shift = highbit64(asize / MS_COUNT_LIMIT);
        }
        VdevConfig {
            asize,
            ashift: SPA_MINBLOCKSHIFT,
            ms_shift,
            nonrot: false,
            class: ClassKind::Normal
        }
    }

    pub fn ashift(mut self, ashift: u32) -> Self {
        self.ashift = ashift;
        self
    }

    pub fn ms_shift(mut self, ms_shift: u32) -> Self {
        self.ms_shift = ms_shift;
        self
    }

    pub fn nonrot(mut self, nonrot: bool) -> Self {
        self.nonrot = nonrot;
        self
    }

    pub fn class(mut self, class: ClassKind) -> Self {
        self.class = class;
        self
    }

    pub fn ms_size(&self) -> u64 {
        1 << self.ms_shift
    }

    /// Number of whole metaslabs.  Any remainder is unused.
    pub fn ms_count(&self) -> u64 {
        self.asize >> self.ms_shift
    }

    pub fn validate(&self) -> Result<()> {
        if self.ashift < SPA_MINBLOCKSHIFT ||
            self.ashift > SPA_MAXBLOCKSHIFT ||
            self.ms_shift <= self.ashift ||
            self.ms_shift >= 63 ||
            self.ms_count() == 0
        {
            Err(Error::EINVAL)
        } else {
            Ok(())
        }
    }
}

// LCOV_EXCL_STOP
