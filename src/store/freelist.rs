//! Free-list trunk blocks and the materialized free-set walk.
//!
//! Freed block ids stack up in block 0 until it is full; the next block
//! to be freed then becomes a *trunk*: it absorbs the stacked ids, links
//! to the previous trunk, and block 0's `free_list_head_block` points at
//! it. Allocation drains the block-0 stack first, then the head trunk's
//! entries, then consumes the empty trunk block itself, and only then
//! extends the store.
//!
//! Trunk content travels through the ordinary diff path, so journal
//! replay reproduces the chain exactly; trunk blocks stay invisible to
//! readers (they were freed by the user, and reads of them report
//! `NotFound`).

use eyre::Result;
use hashbrown::HashSet;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::cache::Block;
use crate::config::{BLOCK_SIZE, TRUNK_CAPACITY};
use crate::error::StoreError;
use crate::store::header::StoreHeader;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TrunkBlock {
    next_trunk: U64,
    count: U64,
    entries: [U64; TRUNK_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<TrunkBlock>() == BLOCK_SIZE);

impl TrunkBlock {
    pub fn view(block: &[u8; BLOCK_SIZE]) -> &Self {
        Self::ref_from_bytes(block).expect("TrunkBlock is unaligned and block-sized")
    }

    pub fn view_mut(block: &mut [u8; BLOCK_SIZE]) -> &mut Self {
        Self::mut_from_bytes(block).expect("TrunkBlock is unaligned and block-sized")
    }

    /// Builds a fresh trunk image chaining to `next_trunk` and holding
    /// `absorbed` ids.
    pub fn build(next_trunk: u64, absorbed: &[u64]) -> Block {
        debug_assert!(absorbed.len() <= TRUNK_CAPACITY);
        let mut block = Block::zero();
        {
            let trunk = Self::view_mut(block.make_mut());
            trunk.next_trunk = U64::new(next_trunk);
            trunk.count = U64::new(absorbed.len() as u64);
            for (slot, id) in trunk.entries.iter_mut().zip(absorbed) {
                *slot = U64::new(*id);
            }
        }
        block
    }

    pub fn next_trunk(&self) -> u64 {
        self.next_trunk.get()
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    pub fn pop(&mut self) -> Option<u64> {
        let count = self.count.get();
        if count == 0 {
            return None;
        }
        let id = self.entries[count as usize - 1].get();
        self.count = U64::new(count - 1);
        Some(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries[..self.count.get() as usize]
            .iter()
            .map(|id| id.get())
    }
}

/// Rebuilds the set of block ids that are free in the materialized
/// store: the block-0 stack, every trunk's entries, and the trunk
/// blocks themselves. `read` resolves a block id to its materialized
/// image.
pub fn materialized_free_set(
    header: &StoreHeader,
    mut read: impl FnMut(u64) -> Result<Block>,
) -> Result<HashSet<u64>> {
    let mut free: HashSet<u64> = header.stack_entries().collect();

    let mut cursor = header.free_list_head_block();
    while cursor != 0 {
        if !free.insert(cursor) {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("free-list trunk chain revisits block {}", cursor)));
        }
        let image = read(cursor)?;
        let trunk = TrunkBlock::view(image.as_array());
        if trunk.count() as usize > TRUNK_CAPACITY {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("trunk block {} overflows its capacity", cursor)));
        }
        free.extend(trunk.entries());
        cursor = trunk.next_trunk();
    }

    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[test]
    fn build_then_pop_drains_in_reverse() {
        let mut image = TrunkBlock::build(0, &[4, 5, 6]);
        let trunk = TrunkBlock::view_mut(image.make_mut());

        assert_eq!(trunk.pop(), Some(6));
        assert_eq!(trunk.pop(), Some(5));
        assert_eq!(trunk.pop(), Some(4));
        assert_eq!(trunk.pop(), None);
        assert!(trunk.is_empty());
    }

    #[test]
    fn walk_collects_stack_trunks_and_their_entries() {
        let mut block0 = [0u8; BLOCK_SIZE];
        StoreHeader::init(&mut block0);
        {
            let header = StoreHeader::view_mut(&mut block0);
            header.push_free(100);
            header.set_free_list_head_block(50);
        }

        let mut blocks = HashMap::new();
        blocks.insert(50u64, TrunkBlock::build(60, &[51, 52]));
        blocks.insert(60u64, TrunkBlock::build(0, &[61]));

        let free = materialized_free_set(StoreHeader::view(&block0), |id| {
            Ok(blocks.get(&id).cloned().unwrap())
        })
        .unwrap();

        let expected: HashSet<u64> = [100, 50, 51, 52, 60, 61].into_iter().collect();
        assert_eq!(free, expected);
    }

    #[test]
    fn walk_rejects_trunk_cycles() {
        let mut block0 = [0u8; BLOCK_SIZE];
        StoreHeader::init(&mut block0);
        StoreHeader::view_mut(&mut block0).set_free_list_head_block(50);

        let mut blocks = HashMap::new();
        blocks.insert(50u64, TrunkBlock::build(60, &[]));
        blocks.insert(60u64, TrunkBlock::build(50, &[]));

        let err = materialized_free_set(StoreHeader::view(&block0), |id| {
            Ok(blocks.get(&id).cloned().unwrap())
        })
        .unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::Corrupt));
    }
}
