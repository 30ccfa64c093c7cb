//! Block images and the version cache.
//!
//! The cache is an ordered mapping from [`BlockSpan`] (a block id plus
//! the transaction that produced the image) to shared [`Block`] buffers.
//! Readers ask for the newest image at or before their transaction via
//! [`VersionCache::find_nearest_before`]; writers insert fresh images as
//! they go. One reader-writer lock guards the map; read hits stamp an
//! atomic LRU tick without upgrading to the write side, the same way the
//! page cache marks accesses under its shard read lock.
//!
//! Returned images are pinned by ownership: every hit clones the `Arc`,
//! so eviction can never invalidate a buffer an in-flight reader holds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;

use crate::config::BLOCK_SIZE;
use crate::error::StoreError;

/// A shared, immutable 4096-byte block image. Writers produce new
/// versions by [`Block::make_mut`], which clones the buffer only when it
/// is shared; an image is never mutated in place while visible to
/// readers.
#[derive(Clone)]
pub struct Block(Arc<[u8; BLOCK_SIZE]>);

impl Block {
    pub fn zero() -> Self {
        Self(Arc::new([0u8; BLOCK_SIZE]))
    }

    /// Copies a caller-supplied image; the slice must be exactly one
    /// block long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return Err(eyre::Report::new(StoreError::Invalid)
                .wrap_err(format!("block image must be {} bytes, got {}", BLOCK_SIZE, bytes.len())));
        }
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self(Arc::new(buf)))
    }

    pub fn from_array(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(Arc::new(bytes))
    }

    pub fn as_array(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Clone-on-write access to the underlying buffer.
    pub fn make_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        Arc::make_mut(&mut self.0)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nonzero = self.0.iter().filter(|b| **b != 0).count();
        write!(f, "Block({} nonzero bytes)", nonzero)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Block {}

/// Identifies one historical image: the value of `block_id` as of the
/// commit of `start_trans_id`. Ordered lexicographically so all versions
/// of a block are adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSpan {
    pub block_id: u64,
    pub start_trans_id: u64,
}

impl BlockSpan {
    pub fn new(block_id: u64, start_trans_id: u64) -> Self {
        Self {
            block_id,
            start_trans_id,
        }
    }
}

/// A cached historical state: the image plus whether the block was
/// freed as of the span's transaction. Freed entries keep their image so
/// writer-internal structures layered on freed blocks (free-list trunks)
/// replay correctly, while user reads translate `freed` to `NotFound`.
#[derive(Debug, Clone)]
pub struct CachedState {
    pub block: Block,
    pub freed: bool,
}

#[derive(Debug)]
struct Slot {
    state: CachedState,
    last_used: AtomicU64,
}

/// Size-bounded ordered cache of historical block images.
#[derive(Debug)]
pub struct VersionCache {
    map: RwLock<BTreeMap<BlockSpan, Slot>>,
    capacity: usize,
    tick: AtomicU64,
}

impl VersionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stamp(&self, slot: &Slot) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        slot.last_used.store(now, Ordering::Relaxed);
    }

    /// Finds the entry for `block_id` with the largest
    /// `start_trans_id <= tid`. Returns the span it was cached under and
    /// a pinned clone of the state.
    pub fn find_nearest_before(&self, block_id: u64, tid: u64) -> Option<(BlockSpan, CachedState)> {
        let map = self.map.read();
        let (span, slot) = map
            .range(..=BlockSpan::new(block_id, tid))
            .next_back()
            .filter(|(span, _)| span.block_id == block_id)?;

        self.stamp(slot);
        Some((*span, slot.state.clone()))
    }

    /// Inserts a state, overwriting any entry with the identical span
    /// and evicting the least-recently-used entry while over capacity.
    pub fn insert(&self, span: BlockSpan, block: Block, freed: bool) {
        let mut map = self.map.write();

        let slot = Slot {
            state: CachedState { block, freed },
            last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed) + 1),
        };
        map.insert(span, slot);

        while map.len() > self.capacity {
            let oldest = map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(span, _)| *span);
            match oldest {
                Some(victim) => {
                    map.remove(&victim);
                }
                None => break,
            }
        }
    }

    /// Drops one entry. Used when a write transaction aborts: its
    /// provisional tid will be reissued, so images inserted under it
    /// must not survive.
    pub fn remove(&self, span: &BlockSpan) {
        self.map.write().remove(span);
    }

    #[cfg(test)]
    fn contains(&self, span: &BlockSpan) -> bool {
        self.map.read().contains_key(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(byte: u8) -> Block {
        Block::from_bytes(&[byte; BLOCK_SIZE]).unwrap()
    }

    #[test]
    fn nearest_before_picks_largest_at_or_below() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(7, 2), filled(2), false);
        cache.insert(BlockSpan::new(7, 5), filled(5), false);
        cache.insert(BlockSpan::new(7, 9), filled(9), false);

        let (span, state) = cache.find_nearest_before(7, 6).unwrap();

        assert_eq!(span, BlockSpan::new(7, 5));
        assert_eq!(state.block, filled(5));
    }

    #[test]
    fn nearest_before_hits_exact_version() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(3, 4), filled(4), false);

        let (span, _) = cache.find_nearest_before(3, 4).unwrap();

        assert_eq!(span.start_trans_id, 4);
    }

    #[test]
    fn nearest_before_never_crosses_blocks() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(2, 8), filled(8), false);

        assert!(cache.find_nearest_before(3, 10).is_none());
    }

    #[test]
    fn nearest_before_misses_older_tid() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(2, 8), filled(8), false);

        assert!(cache.find_nearest_before(2, 7).is_none());
    }

    #[test]
    fn freed_marker_survives_the_cache() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(5, 3), filled(3), true);

        let (_, state) = cache.find_nearest_before(5, 3).unwrap();

        assert!(state.freed);
        assert_eq!(state.block, filled(3));
    }

    #[test]
    fn insert_overwrites_identical_span() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(1, 1), filled(1), false);
        cache.insert(BlockSpan::new(1, 1), filled(2), false);

        let (_, state) = cache.find_nearest_before(1, 1).unwrap();

        assert_eq!(state.block, filled(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let cache = VersionCache::new(2);
        cache.insert(BlockSpan::new(1, 1), filled(1), false);
        cache.insert(BlockSpan::new(2, 1), filled(2), false);

        // Touch (1, 1) so (2, 1) is the LRU victim.
        cache.find_nearest_before(1, 1).unwrap();
        cache.insert(BlockSpan::new(3, 1), filled(3), false);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&BlockSpan::new(1, 1)));
        assert!(!cache.contains(&BlockSpan::new(2, 1)));
    }

    #[test]
    fn evicted_images_stay_valid_for_holders() {
        let cache = VersionCache::new(1);
        cache.insert(BlockSpan::new(1, 1), filled(0xAA), false);
        let (_, pinned) = cache.find_nearest_before(1, 1).unwrap();

        cache.insert(BlockSpan::new(2, 1), filled(0xBB), false);

        assert_eq!(pinned.block, filled(0xAA));
    }

    #[test]
    fn remove_purges_only_that_version() {
        let cache = VersionCache::new(16);
        cache.insert(BlockSpan::new(1, 3), filled(3), false);
        cache.insert(BlockSpan::new(1, 2), filled(2), false);

        cache.remove(&BlockSpan::new(1, 3));

        assert!(!cache.contains(&BlockSpan::new(1, 3)));
        assert!(cache.contains(&BlockSpan::new(1, 2)));
    }

    #[test]
    fn make_mut_clones_shared_buffer() {
        let original = filled(1);
        let mut copy = original.clone();

        copy.make_mut()[0] = 9;

        assert_eq!(original.as_slice()[0], 1);
        assert_eq!(copy.as_slice()[0], 9);
    }
}
