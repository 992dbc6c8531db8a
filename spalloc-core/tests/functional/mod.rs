// vim: tw=80
// rstest_reuse must be imported at the crate root for macro reasons
// https://github.com/la10736/rstest/issues/128
#![allow(clippy::single_component_path_imports)]
use rstest_reuse;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use spalloc_core::{
    object_store::{MemStore, ObjectStore},
    pool::{Pool, PoolConfig},
    tunables::{Tunables, TunablesHandle},
    types::*,
    vdev::VdevConfig,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// An in-memory object store whose reads can be made to fail on demand
#[derive(Debug, Default)]
struct FaultyStore {
    inner: MemStore,
    fail_reads: AtomicBool,
}

impl FaultyStore {
    fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }
}

impl ObjectStore for FaultyStore {
    fn create(&self) -> Result<ObjectT> {
        self.inner.create()
    }

    fn destroy(&self, object: ObjectT) -> Result<()> {
        self.inner.destroy(object)
    }

    fn len(&self, object: ObjectT) -> Result<u64> {
        self.inner.len(object)
    }

    fn read(&self, object: ObjectT, offset: u64, buf: &mut [u8]) -> Result<()>
    {
        if self.fail_reads.load(Ordering::Relaxed) {
            Err(Error::EIO)
        } else {
            self.inner.read(object, offset, buf)
        }
    }

    fn write(&self, object: ObjectT, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write(object, offset, data)
    }

    fn truncate(&self, object: ObjectT, len: u64) -> Result<()> {
        self.inner.truncate(object, len)
    }

    fn read_bonus(&self, object: ObjectT) -> Result<Vec<u8>> {
        self.inner.read_bonus(object)
    }

    fn write_bonus(&self, object: ObjectT, data: &[u8]) -> Result<()> {
        self.inner.write_bonus(object, data)
    }

    fn dir_lookup(&self, key: &str) -> Result<Option<ObjectT>> {
        self.inner.dir_lookup(key)
    }

    fn dir_insert(&self, key: &str, object: ObjectT) -> Result<()> {
        self.inner.dir_insert(key, object)
    }

    fn dir_remove(&self, key: &str) -> Result<()> {
        self.inner.dir_remove(key)
    }
}

struct PoolHarness {
    store: Arc<FaultyStore>,
    tunables: Arc<TunablesHandle>,
    pool: Pool,
}

impl PoolHarness {
    /// Sync `txg` and finish it
    fn sync(&self, txg: TxgT) {
        t!(self.pool.sync(txg));
        self.pool.sync_done(txg);
    }

    /// Sync every txg from `first` through `last`, inclusive
    fn sync_range(&self, first: TxgT, last: TxgT) {
        let mut txg = first;
        while txg <= last {
            self.sync(txg);
            txg += 1;
        }
    }

    /// Drop the pool and open it again from the same store
    fn reopen(self) -> Self {
        let PoolHarness{store, tunables, pool} = self;
        drop(pool);
        let pool = t!(Pool::open(store.clone(), tunables.clone()));
        PoolHarness{store, tunables, pool}
    }
}

/// Helper to create a fresh pool
#[derive(Debug)]
struct PoolBuilder {
    /// Number of devices
    n: usize,
    /// Size of each device in bytes
    vdev_size: u64,
    /// log2 of the metaslab size
    ms_shift: u32,
    allocators: usize,
    log_enabled: bool,
    tunables: Tunables,
}

impl PoolBuilder {
    fn new() -> Self {
        Self {
            n: 1,
            vdev_size: 16 << 20,
            ms_shift: 20,
            allocators: 1,
            log_enabled: false,
            tunables: Tunables {
                preload_enabled: false,
                debug_verify: true,
                ..Default::default()
            }
        }
    }

    fn build(&self) -> PoolHarness {
        let store = Arc::new(FaultyStore::default());
        let tunables = Arc::new(TunablesHandle::new(self.tunables.clone()));
        let config = (0..self.n).fold(
            PoolConfig::default()
                .allocators(self.allocators)
                .log_enabled(self.log_enabled),
            |config, _| config.vdev(
                VdevConfig::new(self.vdev_size).ms_shift(self.ms_shift)));
        let pool = t!(Pool::create(store.clone(), config, tunables.clone()));
        PoolHarness{store, tunables, pool}
    }

    fn allocators(&mut self, allocators: usize) -> &mut Self {
        self.allocators = allocators;
        self
    }

    fn disks(&mut self, n: usize) -> &mut Self {
        self.n = n;
        self
    }

    fn log_enabled(&mut self, log_enabled: bool) -> &mut Self {
        self.log_enabled = log_enabled;
        self
    }

    fn ms_shift(&mut self, ms_shift: u32) -> &mut Self {
        self.ms_shift = ms_shift;
        self
    }

    fn tunables<F: FnOnce(&mut Tunables)>(&mut self, f: F) -> &mut Self {
        f(&mut self.tunables);
        self
    }

    fn vdev_size(&mut self, vdev_size: u64) -> &mut Self {
        self.vdev_size = vdev_size;
        self
    }
}

mod alloc;
mod checkpoint;
mod condense;
mod fault;
mod free;
mod persistence;
mod throttle;
mod vdev;
