// vim: tw=80
//! Persistent object storage used for space maps and allocator metadata
//!
//! The allocator doesn't care how objects are stored, only that each one is a
//! growable byte array plus a small "bonus" buffer, and that a single root
//! directory maps well-known names to objects.

use serde_derive::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::Path,
    sync::RwLock,
};
use crate::types::*;

#[cfg(test)] use mockall::automock;

#[cfg_attr(test, automock)]
pub trait ObjectStore: Send + Sync {
    /// Allocate a new, empty object
    fn create(&self) -> Result<ObjectT>;

    fn destroy(&self, object: ObjectT) -> Result<()>;

    /// Length of the object's data, in bytes
    fn len(&self, object: ObjectT) -> Result<u64>;

    /// Fill `buf` from the object's data beginning at `offset`.  Reading past
    /// the end is an error.
    fn read(&self, object: ObjectT, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, extending the object if necessary.
    fn write(&self, object: ObjectT, offset: u64, data: &[u8]) -> Result<()>;

    fn truncate(&self, object: ObjectT, len: u64) -> Result<()>;

    fn read_bonus(&self, object: ObjectT) -> Result<Vec<u8>>;

    fn write_bonus(&self, object: ObjectT, data: &[u8]) -> Result<()>;

    /// Look up a name in the root directory
    fn dir_lookup(&self, key: &str) -> Result<Option<ObjectT>>;

    /// Add or replace a name in the root directory
    fn dir_insert(&self, key: &str, object: ObjectT) -> Result<()>;

    fn dir_remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct MemObject {
    data: Vec<u8>,
    bonus: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MemStoreInner {
    next: ObjectT,
    objects: BTreeMap<ObjectT, MemObject>,
    dir: BTreeMap<String, ObjectT>,
}

impl Default for MemStoreInner {
    fn default() -> Self {
        MemStoreInner {
            next: 1,
            objects: BTreeMap::new(),
            dir: BTreeMap::new()
        }
    }
}

/// An `ObjectStore` that lives entirely in RAM.
///
/// Its contents may be saved to a file and reloaded later.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.inner.read().unwrap().objects.len()
    }

    /// Load a store previously written by [`MemStore::save`]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let buf = fs::read(path)?;
        let inner: MemStoreInner = bincode::deserialize(&buf[..])?;
        Ok(MemStore{inner: RwLock::new(inner)})
    }

    /// Write the entire store to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let buf = bincode::serialize(&*self.inner.read().unwrap())?;
        let mut f = fs::File::create(path)?;
        f.write_all(&buf[..])?;
        f.sync_all()?;
        Ok(())
    }
}

impl ObjectStore for MemStore {
    fn create(&self) -> Result<ObjectT> {
        let mut inner = self.inner.write().unwrap();
        let object = inner.next;
        inner.next += 1;
        inner.objects.insert(object, MemObject::default());
        Ok(object)
    }

    fn destroy(&self, object: ObjectT) -> Result<()> {
        self.inner.write().unwrap().objects.remove(&object)
            .map(drop)
            .ok_or(Error::ENOENT)
    }

    fn len(&self, object: ObjectT) -> Result<u64> {
        self.inner.read().unwrap().objects.get(&object)
            .map(|o| o.data.len() as u64)
            .ok_or(Error::ENOENT)
    }

    fn read(&self, object: ObjectT, offset: u64, buf: &mut [u8]) -> Result<()>
    {
        let inner = self.inner.read().unwrap();
        let o = inner.objects.get(&object).ok_or(Error::ENOENT)?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > o.data.len() {
            return Err(Error::EIO);
        }
        buf.copy_from_slice(&o.data[start..end]);
        Ok(())
    }

    fn write(&self, object: ObjectT, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let o = inner.objects.get_mut(&object).ok_or(Error::ENOENT)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > o.data.len() {
            o.data.resize(end, 0);
        }
        o.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&self, object: ObjectT, len: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let o = inner.objects.get_mut(&object).ok_or(Error::ENOENT)?;
        o.data.resize(len as usize, 0);
        Ok(())
    }

    fn read_bonus(&self, object: ObjectT) -> Result<Vec<u8>> {
        self.inner.read().unwrap().objects.get(&object)
            .map(|o| o.bonus.clone())
            .ok_or(Error::ENOENT)
    }

    fn write_bonus(&self, object: ObjectT, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let o = inner.objects.get_mut(&object).ok_or(Error::ENOENT)?;
        o.bonus.clear();
        o.bonus.extend_from_slice(data);
        Ok(())
    }

    fn dir_lookup(&self, key: &str) -> Result<Option<ObjectT>> {
        Ok(self.inner.read().unwrap().dir.get(key).cloned())
    }

    fn dir_insert(&self, key: &str, object: ObjectT) -> Result<()> {
        self.inner.write().unwrap().dir.insert(key.to_owned(), object);
        Ok(())
    }

    fn dir_remove(&self, key: &str) -> Result<()> {
        self.inner.write().unwrap().dir.remove(key)
            .map(drop)
            .ok_or(Error::ENOENT)
    }
}

// LCOV_EXCL_STOP
