//! Sparse representation: a flat list of `(timestamp, hash)` points.
//!
//! Small sets are orders of magnitude cheaper as point lists than as
//! `2^precision` registers. The functions here are pure; the storage layer
//! owns the packed bytes and decides when a list has outgrown this form.

use crate::dense::SlidingHll;
use crate::{Error, Result};

/// Point count beyond which a set is converted to the dense format.
pub const SPARSE_MAX_KEYS: usize = 16;

/// A stored value of exactly this byte marks a set that has been promoted to
/// the dense format; the point list must not be resurrected.
pub const DENSE_SENTINEL: &[u8] = b"-";

pub const POINT_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub timestamp: i64,
    pub hash: u64,
}

pub fn decode_points(bytes: &[u8]) -> Result<Vec<Point>> {
    if bytes.len() % POINT_SIZE != 0 {
        return Err(Error::Truncated);
    }
    Ok(bytes
        .chunks_exact(POINT_SIZE)
        .map(|chunk| Point {
            // chunk length is fixed by chunks_exact
            timestamp: i64::from_ne_bytes(chunk[..8].try_into().unwrap()),
            hash: u64::from_ne_bytes(chunk[8..].try_into().unwrap()),
        })
        .collect())
}

pub fn encode_points(points: &[Point]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(points.len() * POINT_SIZE);
    for p in points {
        bytes.extend_from_slice(&p.timestamp.to_ne_bytes());
        bytes.extend_from_slice(&p.hash.to_ne_bytes());
    }
    bytes
}

/// Adds hashes to the point list. A hash that is already present has its
/// timestamp refreshed instead of growing the list. Returns the new length.
pub fn add(points: &mut Vec<Point>, hashes: &[u64], timestamp: i64) -> usize {
    for &hash in hashes {
        match points.iter_mut().find(|p| p.hash == hash) {
            Some(p) => p.timestamp = timestamp,
            None => points.push(Point { timestamp, hash }),
        }
    }
    points.len()
}

/// Count of points inside the window, inclusive on both ends:
/// `timestamp - window <= t <= timestamp`.
pub fn size(points: &[Point], timestamp: i64, window: u64) -> u64 {
    let min_time = timestamp.saturating_sub(window.min(i64::MAX as u64) as i64);
    points
        .iter()
        .filter(|p| p.timestamp >= min_time && p.timestamp <= timestamp)
        .count() as u64
}

/// Replays every point into a dense target, preserving timestamps.
pub fn convert_dense(points: &[Point], target: &mut SlidingHll) {
    for p in points {
        target.add_hash_at(p.hash, p.timestamp);
    }
}
