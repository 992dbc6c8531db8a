// vim: tw=80
//! Common utility functions used throughout spalloc

use std::{
    hash::Hasher,
    ops::{Add, Div, Sub},
};

/// Checksum a list of buffers.
///
/// Unfortunately, hashing a slice is not the same thing as hashing that slice's
/// contents.  The former includes the length of the hash.  But for our
/// purposes, we *want* the concatenation of several buffers to hash the same
/// as a single buffer containing the same bytes.
pub fn checksum_bufs<T, H>(bufs: &[T], hasher: &mut H)
    where T: AsRef<[u8]>, H: Hasher
{
    for buf in bufs {
        hasher.write(buf.as_ref());
    }
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Index of the highest set bit, counting from 1.  Zero for zero.
pub fn highbit64(x: u64) -> u32 {
    64 - x.leading_zeros()
}

/// Index of the lowest set bit, counting from 1.  Zero for zero.
pub fn lowbit64(x: u64) -> u32 {
    if x == 0 {
        0
    } else {
        x.trailing_zeros() + 1
    }
}

pub fn is_p2(x: u64) -> bool {
    x & x.wrapping_sub(1) == 0
}

/// Round `x` down to a multiple of `align`, which must be a power of two
pub fn p2align(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

/// Round `x` up to a multiple of `align`, which must be a power of two
pub fn p2roundup(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

/// The remainder of `x` modulo `align`, which must be a power of two
pub fn p2phase(x: u64, align: u64) -> u64 {
    x & (align - 1)
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn test_div_roundup() {
    assert_eq!(div_roundup(5u8, 2u8), 3u8);
    assert_eq!(div_roundup(4u8, 2u8), 2u8);
    assert_eq!(div_roundup(4000u32, 1500u32), 3u32);
}

#[test]
fn bits() {
    assert_eq!(highbit64(0), 0);
    assert_eq!(highbit64(1), 1);
    assert_eq!(highbit64(0x1000), 13);
    assert_eq!(highbit64(0x1fff), 13);
    assert_eq!(highbit64(u64::MAX), 64);
    assert_eq!(lowbit64(0), 0);
    assert_eq!(lowbit64(0x1800), 12);
}

#[test]
fn p2() {
    assert!(is_p2(4096));
    assert!(!is_p2(4095));
    assert_eq!(p2align(4097, 512), 4096);
    assert_eq!(p2roundup(4097, 512), 4608);
    assert_eq!(p2roundup(4096, 512), 4096);
    assert_eq!(p2phase(4097, 512), 1);
}

#[test]
fn checksum_bufs_matches_single_buffer() {
    use std::collections::hash_map::DefaultHasher;

    let together = vec![0u8, 1, 2, 3, 4, 5];
    let apart = vec![vec![0u8, 1], vec![2u8, 3], vec![4u8, 5]];
    let mut together_hasher = DefaultHasher::new();
    let mut apart_hasher = DefaultHasher::new();
    together_hasher.write(&together[..]);
    checksum_bufs(&apart, &mut apart_hasher);
    assert_eq!(together_hasher.finish(), apart_hasher.finish());
}
}
// LCOV_EXCL_STOP
