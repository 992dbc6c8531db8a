// vim: tw=80

#![cfg_attr(feature = "nightly", feature(plugin))]
#![cfg_attr(all(feature = "nightly", test), feature(test))]

// Disable the range_plus_one lint until this bug is fixed.  It generates many
// false positive in the range tree code.
// https://github.com/rust-lang-nursery/rust-clippy/issues/3307
#![allow(clippy::range_plus_one)]

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

#[cfg(all(feature = "nightly", test))]
extern crate test;

pub mod allocator;
pub mod class;
pub mod group;
pub mod label;
mod log_sm;
pub mod metaslab;
pub mod object_store;
pub mod pool;
pub mod range_tree;
mod size_index;
pub mod space_map;
mod taskq;
mod throttle;
pub mod tunables;
pub mod types;
pub mod util;
pub mod vdev;
pub mod weight;

pub use crate::types::*;
pub use crate::util::*;
pub use crate::{
    allocator::StrategyKind,
    class::ClassStats,
    group::GroupStats,
    metaslab::{LoadState, MetaslabInfo, SpaceSummary},
    object_store::{MemStore, ObjectStore},
    pool::{Pool, PoolConfig},
    tunables::{Tunables, TunablesHandle},
    vdev::{ClassKind, Health, VdevConfig},
    weight::{Activation, Weight},
};
