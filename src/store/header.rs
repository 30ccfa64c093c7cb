//! Block-0 header layout.
//!
//! Block 0 is the store's root: fixed metadata up front, the free-list
//! stack filling the middle, and a CRC64 over everything before the
//! trailing hash. The whole block is little-endian, declared by flags
//! bit 0, and is read and written through zerocopy views over the raw
//! 4096-byte image.
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic "SiltBlk1"
//! 8       4     version (1)
//! 12      4     flags (bit 0: little-endian)
//! 16      8     first_transaction
//! 24      8     last_transaction
//! 32      8     free_list_head_block (0 = no trunk chain)
//! 40      8     next_block_id (append high-water mark)
//! 48      8     free_count (live entries in free_stack)
//! 56      4032  free_stack [u64; 504]
//! 4088    8     crc64 over bytes 0..4088
//! ```
//!
//! The allocator fields (`free_list_head_block`, `next_block_id`,
//! `free_count`, `free_stack`) ride through journal diffs like any other
//! block content, so allocation state is transactional. The transaction
//! watermarks and the hash are rewritten only when a checkpoint
//! materializes a new block 0; in-memory replayed images carry stale
//! hash bytes, which is fine; the hash is validated only against the
//! store file on open.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOCK_SIZE, FREE_STACK_CAPACITY, HEADER_CRC_OFFSET};
use crate::error::StoreError;

pub const STORE_MAGIC: &[u8; 8] = b"SiltBlk1";
pub const STORE_VERSION: u32 = 1;
pub const FLAG_LITTLE_ENDIAN: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    magic: [u8; 8],
    version: U32,
    flags: U32,
    first_transaction: U64,
    last_transaction: U64,
    free_list_head_block: U64,
    next_block_id: U64,
    free_count: U64,
    free_stack: [U64; FREE_STACK_CAPACITY],
    crc: U64,
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == BLOCK_SIZE);

impl StoreHeader {
    /// Initializes a fresh block-0 image: empty free list, no commits,
    /// first allocatable block id 1.
    pub fn init(block: &mut [u8; BLOCK_SIZE]) {
        block.fill(0);
        let header = Self::view_mut(block);
        header.magic = *STORE_MAGIC;
        header.version = U32::new(STORE_VERSION);
        header.flags = U32::new(FLAG_LITTLE_ENDIAN);
        header.next_block_id = U64::new(1);
        header.seal();
    }

    /// Unvalidated view for in-memory images (replayed block 0 has a
    /// stale hash by design).
    pub fn view(block: &[u8; BLOCK_SIZE]) -> &Self {
        Self::ref_from_bytes(block).expect("StoreHeader is unaligned and block-sized")
    }

    pub fn view_mut(block: &mut [u8; BLOCK_SIZE]) -> &mut Self {
        Self::mut_from_bytes(block).expect("StoreHeader is unaligned and block-sized")
    }

    /// Validated view for block 0 as read from the store file: magic,
    /// version, and hash must all hold.
    pub fn validate(block: &[u8; BLOCK_SIZE]) -> Result<&Self> {
        let header = Self::view(block);
        if header.magic != *STORE_MAGIC {
            return Err(eyre::Report::new(StoreError::Corrupt).wrap_err("bad store magic"));
        }
        if header.version.get() != STORE_VERSION {
            return Err(eyre::Report::new(StoreError::Corrupt).wrap_err(format!(
                "unsupported store version {} (expected {})",
                header.version.get(),
                STORE_VERSION
            )));
        }
        if header.flags.get() & FLAG_LITTLE_ENDIAN == 0 {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err("store declares an unsupported byte order"));
        }
        let computed = CRC64.checksum(&block[..HEADER_CRC_OFFSET]);
        if computed != header.crc.get() {
            return Err(
                eyre::Report::new(StoreError::Corrupt).wrap_err("store header hash mismatch")
            );
        }
        Ok(header)
    }

    /// Recomputes the trailing hash; call after editing a block-0 image
    /// that will be written to the store file.
    pub fn seal(&mut self) {
        let crc = CRC64.checksum(&self.as_bytes()[..HEADER_CRC_OFFSET]);
        self.crc = U64::new(crc);
    }

    pub fn first_transaction(&self) -> u64 {
        self.first_transaction.get()
    }

    pub fn set_first_transaction(&mut self, tid: u64) {
        self.first_transaction = U64::new(tid);
    }

    pub fn last_transaction(&self) -> u64 {
        self.last_transaction.get()
    }

    pub fn set_last_transaction(&mut self, tid: u64) {
        self.last_transaction = U64::new(tid);
    }

    pub fn free_list_head_block(&self) -> u64 {
        self.free_list_head_block.get()
    }

    pub fn set_free_list_head_block(&mut self, block_id: u64) {
        self.free_list_head_block = U64::new(block_id);
    }

    pub fn next_block_id(&self) -> u64 {
        self.next_block_id.get()
    }

    pub fn set_next_block_id(&mut self, block_id: u64) {
        self.next_block_id = U64::new(block_id);
    }

    pub fn free_count(&self) -> u64 {
        self.free_count.get()
    }

    pub fn stack_is_full(&self) -> bool {
        self.free_count.get() as usize >= FREE_STACK_CAPACITY
    }

    /// Pushes a freed id onto the block-0 stack; the caller handles the
    /// full case by chaining a trunk.
    pub fn push_free(&mut self, block_id: u64) {
        debug_assert!(!self.stack_is_full());
        let at = self.free_count.get() as usize;
        self.free_stack[at] = U64::new(block_id);
        self.free_count = U64::new(at as u64 + 1);
    }

    pub fn pop_free(&mut self) -> Option<u64> {
        let count = self.free_count.get();
        if count == 0 {
            return None;
        }
        let id = self.free_stack[count as usize - 1].get();
        self.free_count = U64::new(count - 1);
        Some(id)
    }

    /// Drains every stacked id, leaving the stack empty. Used when a
    /// freed block absorbs the stack as a new trunk.
    pub fn drain_stack(&mut self) -> Vec<u64> {
        let count = self.free_count.get() as usize;
        let ids = self.free_stack[..count].iter().map(|id| id.get()).collect();
        self.free_count = U64::new(0);
        ids
    }

    pub fn stack_entries(&self) -> impl Iterator<Item = u64> + '_ {
        self.free_stack[..self.free_count.get() as usize]
            .iter()
            .map(|id| id.get())
    }
}
