// vim: tw=80
//! Framing for the pool label

use byteorder::{BigEndian, ByteOrder};
use crate::{
    types::*,
    util::*
};
use metrohash::MetroHash64;
use serde::{de::DeserializeOwned, Serialize};
use std::{hash::{Hash, Hasher}, io::{self, Seek, SeekFrom}};

/*
 * Label Format:
 *
 * Magic:       16 bytes
 * Checksum:    8 bytes     MetroHash64.  Covers all of Length and Contents.
 * Length:      8 bytes     Length of Contents in bytes
 * Pool:        variable    bincode-encoded Pool::Label
 *
 * The label occupies the whole of one object, registered in the store's root
 * directory under LABEL_KEY.
 */
/// The label magic is "SPALLOC Pool\0\0\0\0"
const MAGIC: &[u8; MAGIC_LEN] = b"SPALLOC Pool\0\0\0\0";
const MAGIC_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const LENGTH_LEN: usize = 8;
const HEADER_LEN: usize = MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN;
/// Root directory key of the label object
pub const LABEL_KEY: &str = "spalloc.label";

/// Used to read successive structs out of the label
pub struct LabelReader {
    cursor: io::Cursor<Vec<u8>>
}

impl LabelReader {
    /// Attempt to read a `T` out of the label
    pub fn deserialize<T>(&mut self) -> bincode::Result<T>
        where T: DeserializeOwned
    {
        bincode::deserialize_from(&mut self.cursor)
    }

    /// Construct a `LabelReader` using the raw buffer read from the store
    pub fn new(buffer: Vec<u8>) -> Result<Self> {
        if buffer.len() < HEADER_LEN {
            return Err(Error::EINVAL);
        }
        if MAGIC[..] != buffer[0..MAGIC_LEN] {
            return Err(Error::EINVAL);
        }

        let checksum = BigEndian::read_u64(
            &buffer[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN]);
        let length_start = MAGIC_LEN + CHECKSUM_LEN;
        let contents_len = BigEndian::read_u64(
            &buffer[length_start .. HEADER_LEN]);
        if HEADER_LEN as u64 + contents_len > buffer.len() as u64 {
            return Err(Error::EINTEGRITY);
        }
        let mut hasher = MetroHash64::new();
        {
            let contents = &buffer[HEADER_LEN ..
                               HEADER_LEN + contents_len as usize];
            contents_len.to_be().hash(&mut hasher);
            hasher.write(contents);
        }
        if checksum != hasher.finish() {
            return Err(Error::EINTEGRITY);
        }

        let mut cursor = io::Cursor::new(buffer);
        // Seek past header
        cursor.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        Ok(LabelReader { cursor })
    }
}

/// Successively writes serialized structs into the label
#[derive(Clone, Debug, Default)]
pub struct LabelWriter {
    buffers: Vec<Vec<u8>>,
}

impl LabelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a `T` into the label.
    ///
    /// Multiple calls to `serialize` take effect in LIFO order.  That is, the
    /// last `serialize` call's data will be encoded into the lowest position in
    /// the label.
    pub fn serialize<T: Serialize>(&mut self, t: &T) -> bincode::Result<()> {
        bincode::serialize(t).map(|v| self.buffers.push(v))
    }

    /// Consume the `LabelWriter` and return the complete label
    pub fn into_bytes(self) -> Vec<u8> {
        let contents = self.buffers.into_iter().rev().collect::<Vec<_>>();
        let contents_len: usize = contents.iter().map(Vec::len).sum();
        let mut hasher = MetroHash64::new();
        (contents_len as u64).to_be().hash(&mut hasher);
        checksum_bufs(&contents, &mut hasher);
        let mut label = Vec::with_capacity(HEADER_LEN + contents_len);
        label.extend_from_slice(&MAGIC[..]);
        label.resize(HEADER_LEN, 0);
        BigEndian::write_u64(&mut label[MAGIC_LEN..], hasher.finish());
        BigEndian::write_u64(&mut label[MAGIC_LEN + CHECKSUM_LEN..],
                             contents_len as u64);
        for buf in contents {
            label.extend(buf);
        }
        label
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn lifo() {
    let mut lw = LabelWriter::new();
    lw.serialize(&0xdead_beefu32).unwrap();
    lw.serialize(&String::from("foo")).unwrap();
    let mut lr = LabelReader::new(lw.into_bytes()).unwrap();
    assert_eq!(lr.deserialize::<String>().unwrap(), "foo");
    assert_eq!(lr.deserialize::<u32>().unwrap(), 0xdead_beef);
}

#[test]
fn bad_checksum() {
    let mut lw = LabelWriter::new();
    lw.serialize(&42u64).unwrap();
    let mut buf = lw.into_bytes();
    let last = buf.len() - 1;
    buf[last] ^= 0xFF;
    assert!(matches!(LabelReader::new(buf), Err(Error::EINTEGRITY)));
}

#[test]
fn bad_magic() {
    let mut lw = LabelWriter::new();
    lw.serialize(&42u64).unwrap();
    let mut buf = lw.into_bytes();
    buf[0] = b'X';
    assert!(matches!(LabelReader::new(buf), Err(Error::EINVAL)));
}

#[test]
fn truncated() {
    let mut lw = LabelWriter::new();
    lw.serialize(&[0u8; 32]).unwrap();
    let mut buf = lw.into_bytes();
    buf.truncate(HEADER_LEN + 8);
    assert!(matches!(LabelReader::new(buf), Err(Error::EINTEGRITY)));
    assert!(matches!(LabelReader::new(vec![0; 4]), Err(Error::EINVAL)));
}
}
// LCOV_EXCL_STOP
