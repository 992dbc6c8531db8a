// vim: tw=80
//! Persistent space maps
//!
//! A space map is an append-only log of allocations and frees within some
//! region of a device, stored in one `ObjectStore` object.  Replaying the log
//! in order reproduces the region's free space.  The object's bonus buffer
//! holds a small header: the log's length, the net allocated space, and a
//! histogram of free segment sizes.
//!
//! On-disk entry format.  Every entry is two little-endian words:
//!
//! ```text
//! word 0:  [63:62] type  (0 = ALLOC, 1 = FREE, 2 = DEBUG)
//!          [61:0]  offset from the map's start, in units of 1 << shift
//!                  (DEBUG: the txg)
//! word 1:  [63:40] vdev id, or SM_NO_VDEVID
//!          [39:0]  run length in units of 1 << shift
//!                  (DEBUG: sync pass << 2 | action)
//! ```

use byteorder::{ByteOrder, LittleEndian};
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use crate::{
    object_store::ObjectStore,
    range_tree::RangeTree,
    types::*,
    util::div_roundup,
};

pub const SM_ENTRY_SIZE: u64 = 16;
const SM_TYPE_SHIFT: u32 = 62;
const SM_OFFSET_MASK: u64 = (1 << SM_TYPE_SHIFT) - 1;
const SM_VDEV_SHIFT: u32 = 40;
/// Longest run that fits in one entry, in units of `1 << shift`
pub const SM_RUN_MAX: u64 = (1 << SM_VDEV_SHIFT) - 1;
pub const SM_NO_VDEVID: u32 = 0xFF_FFFF;
/// Entries are read this many at a time
const SM_READ_CHUNK: u64 = 4096;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MapType {
    Alloc,
    Free
}

impl MapType {
    fn encode(self) -> u64 {
        match self {
            MapType::Alloc => 0,
            MapType::Free => 1,
        }
    }
}

/// One decoded space map entry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SmEntry {
    Range {
        kind: MapType,
        /// Absolute byte offset
        offset: u64,
        /// Length in bytes
        run: u64,
        vdev: Option<VdevT>,
    },
    /// Marks the start of one `write` call
    Debug {
        action: MapType,
        txg: TxgT,
        pass: u32,
    }
}

/// The space map's header, stored in its object's bonus buffer
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SpaceMapPhys {
    /// Length of the log in bytes
    pub length: u64,
    /// Net allocated space.  May be negative for a log space map.
    pub allocated: i64,
    /// Free segments by size class.  Bucket `i` counts segments in
    /// `[2^(i + shift), 2^(i + shift + 1))`, except that the last bucket
    /// holds everything larger.
    pub histogram: [u64; SPACE_MAP_HISTOGRAM_SIZE],
}

impl Default for SpaceMapPhys {
    fn default() -> Self {
        SpaceMapPhys {
            length: 0,
            allocated: 0,
            histogram: [0; SPACE_MAP_HISTOGRAM_SIZE]
        }
    }
}

/// `SpaceMapPhys` plus a self-checksum
#[derive(Debug, Deserialize, Serialize)]
struct PhysOnDisk {
    /// MetroHash64 self-checksum.  Includes the object number, to detect
    /// misdirected writes.
    checksum: u64,
    phys: SpaceMapPhys,
}

impl PhysOnDisk {
    fn checksum(object: ObjectT, phys: &SpaceMapPhys) -> u64 {
        let mut hasher = MetroHash64::new();
        hasher.write_u64(object);
        phys.hash(&mut hasher);
        hasher.finish()
    }

    fn deserialize(object: ObjectT, buf: &[u8])
        -> bincode::Result<Result<SpaceMapPhys>>
    {
        bincode::deserialize::<PhysOnDisk>(buf)
        .map(|pod| {
            if PhysOnDisk::checksum(object, &pod.phys) == pod.checksum {
                Ok(pod.phys)
            } else {
                Err(Error::EINTEGRITY)
            }
        })
    }

    fn serialize(object: ObjectT, phys: &SpaceMapPhys) -> Result<Vec<u8>> {
        let pod = PhysOnDisk {
            checksum: PhysOnDisk::checksum(object, phys),
            phys: phys.clone()
        };
        Ok(bincode::serialize(&pod)?)
    }
}

/// Add a range tree's histogram into a space map style histogram with the
/// given shift.
pub fn fold_histogram(shift: u32, rt_hist: &[u64; RANGE_TREE_HISTOGRAM_SIZE],
                      sm_hist: &mut [u64; SPACE_MAP_HISTOGRAM_SIZE])
{
    let shift = shift as usize;
    let mut idx = 0;
    for (i, &count) in rt_hist.iter().enumerate().skip(shift) {
        sm_hist[idx] += count << (i - idx - shift);
        if idx < SPACE_MAP_HISTOGRAM_SIZE - 1 {
            idx += 1;
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpaceMap {
    object: ObjectT,
    /// First byte described by this map
    start: u64,
    /// Number of bytes described by this map
    size: u64,
    /// log2 of the unit of offsets and run lengths
    shift: u32,
    phys: SpaceMapPhys,
}

impl SpaceMap {
    /// Allocate a new, empty space map object
    pub fn create(store: &dyn ObjectStore, start: u64, size: u64, shift: u32)
        -> Result<Self>
    {
        let object = store.create()?;
        let sm = SpaceMap{object, start, size, shift,
                          phys: SpaceMapPhys::default()};
        sm.write_phys(store)?;
        Ok(sm)
    }

    /// Open an existing space map object
    pub fn open(store: &dyn ObjectStore, object: ObjectT, start: u64,
                size: u64, shift: u32) -> Result<Self>
    {
        let buf = store.read_bonus(object)?;
        let phys = PhysOnDisk::deserialize(object, &buf[..])??;
        Ok(SpaceMap{object, start, size, shift, phys})
    }

    pub fn destroy(self, store: &dyn ObjectStore) -> Result<()> {
        store.destroy(self.object)
    }

    fn write_phys(&self, store: &dyn ObjectStore) -> Result<()> {
        let buf = PhysOnDisk::serialize(self.object, &self.phys)?;
        store.write_bonus(self.object, &buf[..])
    }

    pub fn object(&self) -> ObjectT {
        self.object
    }

    pub fn length(&self) -> u64 {
        self.phys.length
    }

    pub fn allocated(&self) -> i64 {
        self.phys.allocated
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn histogram(&self) -> &[u64; SPACE_MAP_HISTOGRAM_SIZE] {
        &self.phys.histogram
    }

    fn encode_range(&self, buf: &mut Vec<u8>, kind: MapType, start: u64,
                    end: u64, vdev: Option<VdevT>)
    {
        let unit = 1u64 << self.shift;
        assert!(start >= self.start && end <= self.start + self.size,
            "segment [{start:#x}, {end:#x}) lies outside of space map");
        assert!(start % unit == 0 && end % unit == 0,
            "segment [{start:#x}, {end:#x}) is misaligned");
        let vdev = u64::from(vdev.unwrap_or(SM_NO_VDEVID));
        let mut offset = (start - self.start) >> self.shift;
        let mut remaining = (end - start) >> self.shift;
        while remaining > 0 {
            let run = remaining.min(SM_RUN_MAX);
            let mut entry = [0u8; SM_ENTRY_SIZE as usize];
            LittleEndian::write_u64(&mut entry[0..8],
                kind.encode() << SM_TYPE_SHIFT | offset);
            LittleEndian::write_u64(&mut entry[8..16],
                vdev << SM_VDEV_SHIFT | run);
            buf.extend_from_slice(&entry[..]);
            offset += run;
            remaining -= run;
        }
    }

    fn encode_debug(buf: &mut Vec<u8>, action: MapType, txg: TxgT, pass: u32)
    {
        let mut entry = [0u8; SM_ENTRY_SIZE as usize];
        LittleEndian::write_u64(&mut entry[0..8],
            2 << SM_TYPE_SHIFT | (txg.0 & SM_OFFSET_MASK));
        LittleEndian::write_u64(&mut entry[8..16],
            u64::from(pass) << 2 | action.encode());
        buf.extend_from_slice(&entry[..]);
    }

    fn decode(&self, entry: &[u8]) -> Result<SmEntry> {
        let w0 = LittleEndian::read_u64(&entry[0..8]);
        let w1 = LittleEndian::read_u64(&entry[8..16]);
        let kind = match w0 >> SM_TYPE_SHIFT {
            0 => MapType::Alloc,
            1 => MapType::Free,
            2 => {
                let action = if w1 & 3 == 0 {
                    MapType::Alloc
                } else {
                    MapType::Free
                };
                return Ok(SmEntry::Debug {
                    action,
                    txg: TxgT(w0 & SM_OFFSET_MASK),
                    pass: (w1 >> 2) as u32
                });
            }
            _ => return Err(Error::EINTEGRITY)
        };
        let vdev = (w1 >> SM_VDEV_SHIFT) as u32;
        Ok(SmEntry::Range {
            kind,
            offset: self.start + ((w0 & SM_OFFSET_MASK) << self.shift),
            run: (w1 & SM_RUN_MAX) << self.shift,
            vdev: if vdev == SM_NO_VDEVID { None } else { Some(vdev) },
        })
    }

    /// Append one record per segment, all of type `kind`.
    ///
    /// `segs` yields `(start, end)` pairs.
    pub fn write<I>(&mut self, store: &dyn ObjectStore, segs: I, kind: MapType,
                    vdev: Option<VdevT>, txg: TxgT, pass: u32) -> Result<()>
        where I: IntoIterator<Item=(u64, u64)>
    {
        let mut buf = Vec::new();
        let mut space = 0;
        SpaceMap::encode_debug(&mut buf, kind, txg, pass);
        for (start, end) in segs {
            self.encode_range(&mut buf, kind, start, end, vdev);
            space += end - start;
        }
        if space == 0 {
            return Ok(());
        }
        store.write(self.object, self.phys.length, &buf[..])?;
        self.phys.length += buf.len() as u64;
        match kind {
            MapType::Alloc => self.phys.allocated += space as i64,
            MapType::Free => self.phys.allocated -= space as i64,
        }
        self.write_phys(store)
    }

    /// Call `f` on every entry within the first `length` bytes of the log.
    pub fn iterate<F>(&self, store: &dyn ObjectStore, length: u64, mut f: F)
        -> Result<()>
        where F: FnMut(SmEntry) -> Result<()>
    {
        let length = length.min(self.phys.length);
        let chunk = SM_READ_CHUNK * SM_ENTRY_SIZE;
        let mut offset = 0;
        let mut buf = Vec::new();
        while offset < length {
            let len = chunk.min(length - offset);
            buf.resize(len as usize, 0);
            store.read(self.object, offset, &mut buf[..])?;
            for entry in buf.chunks_exact(SM_ENTRY_SIZE as usize) {
                f(self.decode(entry)?)?;
            }
            offset += len;
        }
        Ok(())
    }

    /// Replay the first `length` bytes of the log into `rt`, which must be
    /// empty.
    ///
    /// With `MapType::Free`, `rt` ends up holding the free space.  With
    /// `MapType::Alloc`, it holds the allocated space.
    pub fn load(&self, store: &dyn ObjectStore, rt: &mut RangeTree,
                maptype: MapType, length: u64) -> Result<()>
    {
        assert!(rt.is_empty());
        if maptype == MapType::Free {
            rt.add(self.start, self.size);
        }
        self.iterate(store, length, |entry| {
            if let SmEntry::Range{kind, offset, run, ..} = entry {
                if kind == maptype {
                    if rt.intersects(offset, run) {
                        return Err(Error::EINTEGRITY);
                    }
                    rt.add(offset, run);
                } else {
                    if !rt.contains(offset, run) {
                        return Err(Error::EINTEGRITY);
                    }
                    rt.remove(offset, run);
                }
            }
            Ok(())
        })
    }

    /// Discard the entire log and histogram
    pub fn truncate(&mut self, store: &dyn ObjectStore) -> Result<()> {
        store.truncate(self.object, 0)?;
        self.phys = SpaceMapPhys::default();
        self.write_phys(store)
    }

    pub fn histogram_clear(&mut self) {
        self.phys.histogram = [0; SPACE_MAP_HISTOGRAM_SIZE];
    }

    /// Add a range tree's histogram to our own.
    ///
    /// Range tree buckets are finer grained than ours, so buckets below our
    /// shift are dropped and those past our last bucket are folded into it,
    /// weighted by how much larger they are.
    pub fn histogram_add(&mut self,
                         rt_hist: &[u64; RANGE_TREE_HISTOGRAM_SIZE])
    {
        fold_histogram(self.shift, rt_hist, &mut self.phys.histogram);
    }

    /// Persist any histogram changes
    pub fn sync_phys(&self, store: &dyn ObjectStore) -> Result<()> {
        self.write_phys(store)
    }

    /// Estimate how large this map would be if it described exactly the
    /// segments in `rt`.
    pub fn estimate_optimal_size(&self, rt: &RangeTree) -> u64 {
        let entries: u64 = rt.histogram().iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(i, &count)| {
                // Assume the worst case within the bucket
                let units = (2u64 << i.min(62)) >> self.shift;
                count * div_roundup(units.max(1), SM_RUN_MAX)
            }).sum();
        entries * SM_ENTRY_SIZE
    }
}

// LCOV_EXCL_STOP
