//! # thinbak-chunk
//!
//! Pure chunk arithmetic for thinbak: changed byte extents in, ordered
//! chunk indices out.
//!
//! A volume is divided into fixed-size chunks (`chunk_size` bytes, a power
//! of two). The diff source reports change as half-open byte extents
//! `[start, end)`; this crate maps them onto the set of chunk indices any
//! extent touches, and owns the persisted [`ChunkSet`] that accumulates
//! those indices between backup sessions.
//!
//! No I/O happens here.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)` reported as changed.
///
/// Extents from a well-behaved diff source are non-overlapping and
/// ascending, but nothing in this crate depends on that: mapping is a
/// plain set union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "extent start must not exceed end");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks needed to cover `volume_size` bytes (`ceil(size/C)`).
pub fn chunk_count(volume_size: u64, chunk_size: u64) -> u64 {
    assert_chunk_size(chunk_size);
    volume_size.div_ceil(chunk_size)
}

/// Byte offset of chunk `index`.
pub fn chunk_offset(index: u64, chunk_size: u64) -> u64 {
    assert_chunk_size(chunk_size);
    index * chunk_size
}

fn assert_chunk_size(chunk_size: u64) {
    assert!(
        chunk_size > 0 && chunk_size.is_power_of_two(),
        "chunk_size must be a positive power of two, got {chunk_size}"
    );
}

/// Ordered, deduplicated set of chunk indices.
///
/// This is both the output of [`map_extents`] and the persisted
/// changed-chunk set a volume accumulates between sessions. It only ever
/// grows between sessions (monitor ticks union into it); the session
/// builder clears it atomically when a session commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkSet(BTreeSet<u64>);

impl ChunkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.0.contains(&index)
    }

    pub fn insert(&mut self, index: u64) -> bool {
        self.0.insert(index)
    }

    /// Mark every chunk touched by `extent` as changed.
    pub fn insert_extent(&mut self, extent: Extent, chunk_size: u64) {
        assert_chunk_size(chunk_size);
        if extent.is_empty() {
            return;
        }
        let first = extent.start / chunk_size;
        let last = (extent.end - 1) / chunk_size;
        for index in first..=last {
            self.0.insert(index);
        }
    }

    /// Mark a contiguous run of chunk indices `[first, last)` as changed.
    ///
    /// Used when a volume grows between sessions: the new tail has no diff
    /// history and must be sent in full.
    pub fn insert_index_range(&mut self, first: u64, last: u64) {
        for index in first..last {
            self.0.insert(index);
        }
    }

    /// Union another set into this one. Idempotent.
    pub fn union_with(&mut self, other: &ChunkSet) {
        for &index in &other.0 {
            self.0.insert(index);
        }
    }

    /// Drop indices at or beyond `total_chunks` (volume shrank).
    pub fn truncate_to(&mut self, total_chunks: u64) {
        self.0.retain(|&index| index < total_chunks);
    }

    /// Ascending iteration over the indices.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u64> for ChunkSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Map changed extents to the ordered set of chunk indices they touch.
///
/// For each extent `[s, e)` the covered indices are
/// `floor(s/C) ..= floor((e-1)/C)`; the result is the union across all
/// extents, ascending, each index at most once. Pure and deterministic.
///
/// `chunk_size` must be a positive power of two; anything else is a caller
/// contract violation and panics.
pub fn map_extents<I>(extents: I, chunk_size: u64) -> ChunkSet
where
    I: IntoIterator<Item = Extent>,
{
    assert_chunk_size(chunk_size);
    let mut set = ChunkSet::new();
    for extent in extents {
        set.insert_extent(extent, chunk_size);
    }
    set
}
