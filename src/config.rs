//! Configuration constants and the per-store [`StoreConfig`].
//!
//! Constants that depend on each other are co-located and guarded by
//! compile-time assertions so a change to one cannot silently invalidate
//! another.
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> HEADER_CRC_OFFSET (BLOCK_SIZE - 8, trailing hash in block 0)
//!       │
//!       ├─> FREE_STACK_CAPACITY (block-0 free stack entries)
//!       │
//!       └─> TRUNK_CAPACITY (entries per free-list trunk block)
//! ```

use std::time::Duration;

/// Size of every block in bytes. Block ids address the store file at
/// `block_id * BLOCK_SIZE`.
pub const BLOCK_SIZE: usize = 4096;

/// Byte offset of the trailing CRC64 in block 0.
pub const HEADER_CRC_OFFSET: usize = BLOCK_SIZE - 8;

/// Fixed header fields in block 0 before the free-list payload:
/// magic (8) + version (4) + flags (4) + first/last transaction (16) +
/// free_list_head_block (8) + next_block_id (8) + free_count (8).
pub const HEADER_FIXED_SIZE: usize = 56;

/// Number of free block ids the block-0 stack can hold.
pub const FREE_STACK_CAPACITY: usize = (HEADER_CRC_OFFSET - HEADER_FIXED_SIZE) / 8;

/// Number of free block ids a trunk block can hold after its
/// next-pointer and count fields.
pub const TRUNK_CAPACITY: usize = (BLOCK_SIZE - 16) / 8;

const _: () = assert!(HEADER_FIXED_SIZE + FREE_STACK_CAPACITY * 8 + 8 == BLOCK_SIZE);
const _: () = assert!(16 + TRUNK_CAPACITY * 8 == BLOCK_SIZE);

/// Commit count between automatic inline checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 256;

/// Maximum number of cached block versions.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Journal length that forces an inline checkpoint regardless of the
/// commit interval.
pub const DEFAULT_JOURNAL_SOFT_CAP: u64 = 1024 * 1024 * 1024;

/// Default deadline for lock acquisition in `close`'s final checkpoint.
pub const CLOSE_CHECKPOINT_DEADLINE: Duration = Duration::from_secs(5);

/// Tuning knobs accepted by [`crate::BlockStore::create`] and
/// [`crate::BlockStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Run an inline checkpoint after every `checkpoint_interval`-th
    /// commit.
    pub checkpoint_interval: u64,
    /// Capacity of the block version cache, in entries.
    pub cache_capacity: usize,
    /// Journal length in bytes beyond which a commit forces a
    /// checkpoint.
    pub journal_soft_cap: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            journal_soft_cap: DEFAULT_JOURNAL_SOFT_CAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_stack_fills_block_zero_exactly() {
        assert_eq!(FREE_STACK_CAPACITY, 504);
        assert_eq!(HEADER_FIXED_SIZE + FREE_STACK_CAPACITY * 8 + 8, BLOCK_SIZE);
    }

    #[test]
    fn trunk_capacity_fills_a_block_exactly() {
        assert_eq!(TRUNK_CAPACITY, 510);
        assert_eq!(16 + TRUNK_CAPACITY * 8, BLOCK_SIZE);
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = StoreConfig::default();

        assert_eq!(config.checkpoint_interval, 256);
        assert_eq!(config.cache_capacity, 512);
        assert_eq!(config.journal_soft_cap, 1024 * 1024 * 1024);
    }
}
