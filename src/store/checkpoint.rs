//! Checkpoint side-file format.
//!
//! A checkpoint materializes a committed journal prefix into new block
//! images. The images are first written to a side file so the store
//! file is only ever touched with fully durable data:
//!
//! ```text
//! +----------------------------+---------------------+-----+-------+
//! | header (40 bytes)          | entries             | ... | crc64 |
//! | magic, version, H, last, n | id, kind, [image]   |     |       |
//! +----------------------------+---------------------+-----+-------+
//! ```
//!
//! Every entry carries the block's final 4096-byte image; `kind` 1
//! marks a tombstone, a block that is free at the horizon. Tombstones
//! keep their bytes because freed blocks can hold live free-list trunk
//! data; freed-ness is a visibility property, not an erasure. The
//! trailing CRC64 covers the header and every entry.
//!
//! The file is assembled as `<store>.checkpoint.tmp`, fsynced, then
//! renamed to `<store>.checkpoint`, so the recovery name never refers
//! to a half-written file. Recovery still validates the hash before
//! applying anything; on mismatch the journal remains the source of
//! truth.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::cache::Block;
use crate::config::BLOCK_SIZE;
use crate::error::StoreError;
use crate::fs::{Directory, File};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"SiltCkp1";
pub const CHECKPOINT_VERSION: u32 = 1;

const KIND_IMAGE: u64 = 0;
const KIND_TOMBSTONE: u64 = 1;

const HEADER_SIZE: usize = 40;
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CheckpointHeader {
    magic: [u8; 8],
    version: U32,
    reserved: U32,
    first_transaction: U64,
    last_transaction: U64,
    entry_count: U64,
}

const _: () = assert!(std::mem::size_of::<CheckpointHeader>() == HEADER_SIZE);

/// One materialized block: its final image, plus whether the block is
/// free (a tombstone) at the horizon.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub block_id: u64,
    pub freed: bool,
    pub image: Block,
}

/// A decoded (or to-be-written) checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointData {
    /// The fold horizon; becomes the store's `first_transaction`.
    pub first_transaction: u64,
    pub last_transaction: u64,
    pub entries: Vec<CheckpointEntry>,
}

/// Writes `data` to `tmp_name`, fsyncs, and renames it to `final_name`.
pub fn write(dir: &Directory, tmp_name: &str, final_name: &str, data: &CheckpointData) -> Result<()> {
    let mut file = dir
        .create_file(tmp_name, true)
        .wrap_err("failed to create checkpoint side file")?;

    let header = CheckpointHeader {
        magic: *CHECKPOINT_MAGIC,
        version: U32::new(CHECKPOINT_VERSION),
        reserved: U32::new(0),
        first_transaction: U64::new(data.first_transaction),
        last_transaction: U64::new(data.last_transaction),
        entry_count: U64::new(data.entries.len() as u64),
    };

    let mut digest = CRC64.digest();
    digest.update(header.as_bytes());
    file.write_all(header.as_bytes())?;

    for entry in &data.entries {
        let kind = if entry.freed { KIND_TOMBSTONE } else { KIND_IMAGE };
        let mut prefix = [0u8; 16];
        prefix[..8].copy_from_slice(&entry.block_id.to_le_bytes());
        prefix[8..].copy_from_slice(&kind.to_le_bytes());
        digest.update(&prefix);
        file.write_all(&prefix)?;

        digest.update(entry.image.as_slice());
        file.write_all(entry.image.as_slice())?;
    }

    file.write_all(&digest.finalize().to_le_bytes())?;
    file.sync()?;
    drop(file);

    dir.rename_file(tmp_name, final_name)?;
    dir.sync()
}

/// Reads and validates a checkpoint file. Structural or hash defects
/// are [`StoreError::Corrupt`]; the caller decides whether that means
/// "discard and trust the journal" (recovery) or a hard failure.
pub fn load(dir: &Directory, name: &str) -> Result<CheckpointData> {
    let file = dir.open_file(name, true)?;
    let len = file.len()? as usize;
    if len < HEADER_SIZE + 8 {
        return Err(eyre::Report::new(StoreError::Corrupt)
            .wrap_err("checkpoint file shorter than its header"));
    }

    let mut bytes = vec![0u8; len];
    file.read_exact_at(&mut bytes, 0)?;

    let stored_crc = u64::from_le_bytes(bytes[len - 8..].try_into().unwrap());
    if CRC64.checksum(&bytes[..len - 8]) != stored_crc {
        return Err(eyre::Report::new(StoreError::Corrupt)
            .wrap_err("checkpoint hash mismatch"));
    }

    let header = CheckpointHeader::read_from_bytes(&bytes[..HEADER_SIZE])
        .expect("CheckpointHeader is unaligned and sized to the buffer");
    if header.magic != *CHECKPOINT_MAGIC || header.version.get() != CHECKPOINT_VERSION {
        return Err(eyre::Report::new(StoreError::Corrupt)
            .wrap_err("checkpoint magic or version mismatch"));
    }

    let mut entries = Vec::with_capacity(header.entry_count.get() as usize);
    let mut pos = HEADER_SIZE;
    let body_end = len - 8;
    while pos < body_end {
        if pos + 16 > body_end {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err("checkpoint entry truncated"));
        }
        let block_id = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let kind = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
        pos += 16;

        let freed = match kind {
            KIND_IMAGE => false,
            KIND_TOMBSTONE => true,
            other => {
                return Err(eyre::Report::new(StoreError::Corrupt)
                    .wrap_err(format!("unknown checkpoint entry kind {}", other)));
            }
        };
        if pos + BLOCK_SIZE > body_end {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err("checkpoint image truncated"));
        }
        let image = Block::from_bytes(&bytes[pos..pos + BLOCK_SIZE])?;
        pos += BLOCK_SIZE;
        entries.push(CheckpointEntry {
            block_id,
            freed,
            image,
        });
    }

    if entries.len() as u64 != header.entry_count.get() {
        return Err(eyre::Report::new(StoreError::Corrupt)
            .wrap_err("checkpoint entry count mismatch"));
    }

    Ok(CheckpointData {
        first_transaction: header.first_transaction.get(),
        last_transaction: header.last_transaction.get(),
        entries,
    })
}

/// Writes every entry into the store file at `block_id * BLOCK_SIZE`
/// and fsyncs. Block 0 lands last, behind its own fsync barrier: it
/// carries the advanced transaction watermarks, and those must not
/// reach the store file until every other block is durably in place.
/// A failure or crash anywhere in here leaves the old watermarks
/// intact, so the side file (or the journal) remains authoritative.
/// Safe to repeat: applying the same checkpoint twice writes the same
/// bytes.
pub fn apply(store_file: &File, data: &CheckpointData) -> Result<()> {
    for entry in data.entries.iter().filter(|e| e.block_id != 0) {
        store_file.write_all_at(entry.image.as_slice(), entry.block_id * BLOCK_SIZE as u64)?;
    }
    store_file.sync()?;

    for entry in data.entries.iter().filter(|e| e.block_id == 0) {
        store_file.write_all_at(entry.image.as_slice(), 0)?;
    }
    store_file.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> CheckpointData {
        CheckpointData {
            first_transaction: 12,
            last_transaction: 15,
            entries: vec![
                CheckpointEntry {
                    block_id: 0,
                    freed: false,
                    image: Block::from_bytes(&[1u8; BLOCK_SIZE]).unwrap(),
                },
                CheckpointEntry {
                    block_id: 3,
                    freed: true,
                    image: Block::from_bytes(&[3u8; BLOCK_SIZE]).unwrap(),
                },
                CheckpointEntry {
                    block_id: 7,
                    freed: false,
                    image: Block::from_bytes(&[9u8; BLOCK_SIZE]).unwrap(),
                },
            ],
        }
    }

    #[test]
    fn write_then_load_roundtrips() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();

        write(&dir, "c.tmp", "c", &sample()).unwrap();
        let loaded = load(&dir, "c").unwrap();

        assert!(!dir.exists("c.tmp"));
        assert_eq!(loaded.first_transaction, 12);
        assert_eq!(loaded.last_transaction, 15);
        assert_eq!(loaded.entries.len(), 3);
        assert_eq!(loaded.entries[1].block_id, 3);
        assert!(loaded.entries[1].freed);
        assert_eq!(loaded.entries[1].image.as_slice()[0], 3);
        assert!(!loaded.entries[2].freed);
        assert_eq!(loaded.entries[2].image.as_slice()[0], 9);
    }

    #[test]
    fn load_rejects_a_flipped_bit() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        write(&dir, "c.tmp", "c", &sample()).unwrap();

        let file = dir.open_file("c", false).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, 60).unwrap();
        byte[0] ^= 0x40;
        file.write_all_at(&byte, 60).unwrap();
        file.sync().unwrap();

        let err = load(&dir, "c").unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::Corrupt));
    }

    #[test]
    fn load_rejects_truncation() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        write(&dir, "c.tmp", "c", &sample()).unwrap();

        let file = dir.open_file("c", false).unwrap();
        let len = file.len().unwrap();
        file.truncate(len - 100).unwrap();
        file.sync().unwrap();

        let err = load(&dir, "c").unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::Corrupt));
    }

    #[test]
    fn apply_writes_every_entry_in_place() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let store = dir.create_file("store", true).unwrap();
        store
            .write_all_at(&[0xFFu8; BLOCK_SIZE * 8], 0)
            .unwrap();

        apply(&store, &sample()).unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        store.read_exact_at(&mut block, 0).unwrap();
        assert_eq!(block, [1u8; BLOCK_SIZE]);

        // Tombstones keep their bytes; freed-ness lives in the free
        // list, not in erasure.
        store
            .read_exact_at(&mut block, 3 * BLOCK_SIZE as u64)
            .unwrap();
        assert_eq!(block, [3u8; BLOCK_SIZE]);

        store
            .read_exact_at(&mut block, 7 * BLOCK_SIZE as u64)
            .unwrap();
        assert_eq!(block, [9u8; BLOCK_SIZE]);

        // Untouched blocks keep their bytes.
        store
            .read_exact_at(&mut block, BLOCK_SIZE as u64)
            .unwrap();
        assert_eq!(block, [0xFFu8; BLOCK_SIZE]);
    }
}
