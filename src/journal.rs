//! Append-only journal of transaction frames.
//!
//! One frame per committed write transaction:
//!
//! ```text
//! +-------------------------+------------------------+-----------+
//! | Begin (tag, tid, len)   | records (len bytes)    | Commit    |
//! | 24 bytes                | Alloc | Free | Diff ...| 8 bytes   |
//! +-------------------------+------------------------+-----------+
//! ```
//!
//! All tags are 8-byte little-endian codes (`Begin=0, Alloc=1, Free=2,
//! Diff=3, Commit=4`). `len` counts only the records between `Begin` and
//! `Commit`. A frame is durable once `Commit` is on disk and fsynced;
//! anything less is truncated away on open.
//!
//! Appends go through a mutex that owns the write cursor; replay never
//! touches that cursor: readers use positioned reads against their own
//! snapshot of the frame index, so a reader replaying history cannot
//! perturb an in-flight commit.
//!
//! On a writable store the journal file carries the whole-file advisory
//! exclusive lock for the lifetime of the handle; failing to take it is
//! how a second writer is refused.

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::BLOCK_SIZE;
use crate::diff;
use crate::error::StoreError;
use crate::fs::{Directory, File};

pub const TAG_BEGIN: u64 = 0;
pub const TAG_ALLOC: u64 = 1;
pub const TAG_FREE: u64 = 2;
pub const TAG_DIFF: u64 = 3;
pub const TAG_COMMIT: u64 = 4;

pub const BEGIN_SIZE: usize = 24;
pub const COMMIT_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BeginRecord {
    tag: U64,
    tid: U64,
    length: U64,
}

const _: () = assert!(std::mem::size_of::<BeginRecord>() == BEGIN_SIZE);

/// One decoded record from a frame's records section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    Alloc(u64),
    Free(u64),
    Diff { block_id: u64, payload: &'a [u8] },
}

impl<'a> Record<'a> {
    pub fn block_id(&self) -> u64 {
        match self {
            Record::Alloc(id) | Record::Free(id) => *id,
            Record::Diff { block_id, .. } => *block_id,
        }
    }
}

/// Parses a records section into individual records. Any structural
/// defect is [`StoreError::Corrupt`]: the section sits between a valid
/// `Begin` and `Commit`, so damage here is not a torn tail.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<Record<'_>>> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let tag = read_u64(bytes, &mut pos)?;
        let record = match tag {
            TAG_ALLOC => Record::Alloc(read_u64(bytes, &mut pos)?),
            TAG_FREE => Record::Free(read_u64(bytes, &mut pos)?),
            TAG_DIFF => {
                let block_id = read_u64(bytes, &mut pos)?;
                let len = read_u64(bytes, &mut pos)? as usize;
                if pos + len > bytes.len() {
                    return Err(eyre::Report::new(StoreError::Corrupt)
                        .wrap_err("diff record overruns its frame"));
                }
                let payload = &bytes[pos..pos + len];
                pos += len;
                Record::Diff { block_id, payload }
            }
            other => {
                return Err(eyre::Report::new(StoreError::Corrupt)
                    .wrap_err(format!("unknown record tag {}", other)));
            }
        };
        records.push(record);
    }

    Ok(records)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    if *pos + 8 > bytes.len() {
        return Err(eyre::Report::new(StoreError::Corrupt)
            .wrap_err("record truncated inside a frame"));
    }
    let value = u64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(value)
}

/// The writer's in-memory frame under construction. `reset` seeds a
/// provisional `Begin` whose length is backfilled by `finalize`.
#[derive(Debug, Default)]
pub struct LogBuffer {
    buf: Vec<u8>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, tid: u64) {
        self.buf.clear();
        let begin = BeginRecord {
            tag: U64::new(TAG_BEGIN),
            tid: U64::new(tid),
            length: U64::new(0),
        };
        self.buf.extend_from_slice(begin.as_bytes());
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_armed(&self) -> bool {
        self.buf.len() >= BEGIN_SIZE
    }

    fn push_u64(&mut self, value: u64) -> Result<()> {
        self.check_room(8)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn check_room(&self, extra: usize) -> Result<()> {
        if self.buf.len() as u64 + extra as u64 > i64::MAX as u64 {
            return Err(eyre::Report::new(StoreError::Oversize));
        }
        Ok(())
    }

    pub fn push_alloc(&mut self, block_id: u64) -> Result<()> {
        self.push_u64(TAG_ALLOC)?;
        self.push_u64(block_id)
    }

    pub fn push_free(&mut self, block_id: u64) -> Result<()> {
        self.push_u64(TAG_FREE)?;
        self.push_u64(block_id)
    }

    /// Appends a `Diff` record carrying the delta `old -> new`.
    pub fn push_diff(
        &mut self,
        block_id: u64,
        old: &[u8; BLOCK_SIZE],
        new: &[u8; BLOCK_SIZE],
    ) -> Result<()> {
        self.push_u64(TAG_DIFF)?;
        self.push_u64(block_id)?;

        let len_at = self.buf.len();
        self.push_u64(0)?;
        diff::encode(old, new, &mut self.buf)?;

        let payload_len = (self.buf.len() - len_at - 8) as u64;
        self.buf[len_at..len_at + 8].copy_from_slice(&payload_len.to_le_bytes());
        Ok(())
    }

    /// Backfills the `Begin` length, appends `Commit`, and returns the
    /// completed frame bytes.
    pub fn finalize(&mut self, tid: u64) -> Result<&[u8]> {
        debug_assert!(self.is_armed(), "finalize without reset");

        let records_len = (self.buf.len() - BEGIN_SIZE) as u64;
        let begin = BeginRecord {
            tag: U64::new(TAG_BEGIN),
            tid: U64::new(tid),
            length: U64::new(records_len),
        };
        self.buf[..BEGIN_SIZE].copy_from_slice(begin.as_bytes());
        self.push_u64(TAG_COMMIT)?;
        Ok(&self.buf)
    }
}

/// Location of one committed frame inside the journal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub tid: u64,
    /// Offset of the records section (just past `Begin`).
    pub records_offset: u64,
    pub records_len: u64,
}

/// The on-disk journal: a single append-only file of frames.
#[derive(Debug)]
pub struct Journal {
    file: Option<File>,
    append: Mutex<()>,
    frames: RwLock<Vec<FrameMeta>>,
}

impl Journal {
    /// Opens (read/write: creating and locking) the journal and scans it.
    ///
    /// A torn tail is truncated on writable stores and ignored on
    /// read-only ones; a malformed frame that is fully contained before
    /// other data fails with [`StoreError::Corrupt`].
    pub fn open(dir: &Directory, name: &str, read_only: bool) -> Result<Self> {
        let file = if read_only {
            if dir.exists(name) {
                Some(dir.open_file(name, true)?)
            } else {
                None
            }
        } else {
            let file = if dir.exists(name) {
                dir.open_file(name, false)?
            } else {
                dir.create_file(name, false)?
            };
            file.lock_exclusive()
                .wrap_err_with(|| format!("another writer holds {}", name))?;
            Some(file)
        };

        let mut frames = Vec::new();
        if let Some(file) = &file {
            let (scanned, valid_len, torn) = scan(file)?;
            frames = scanned;
            if torn {
                warn!(
                    journal = name,
                    valid_len, "truncating torn journal tail"
                );
                if !read_only {
                    file.truncate(valid_len)?;
                    file.sync()?;
                }
            }
        }

        debug!(journal = name, frames = frames.len(), "journal opened");
        Ok(Self {
            file,
            append: Mutex::new(()),
            frames: RwLock::new(frames),
        })
    }

    /// Highest committed tid present, if any.
    pub fn last_commit_tid(&self) -> Option<u64> {
        self.frames.read().last().map(|f| f.tid)
    }

    pub fn len(&self) -> Result<u64> {
        match &self.file {
            Some(file) => file.len(),
            None => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends one finalized frame: seek to end, write, fsync. On any
    /// failure the file is wound back to its pre-append length so a
    /// partial frame never survives.
    pub fn append_frame(&self, tid: u64, frame: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .expect("append on a read-only journal");
        let _guard = self.append.lock();

        let start = file.len()?;
        let result = file
            .write_all_at(frame, start)
            .and_then(|_| file.sync());

        if let Err(e) = result {
            // Roll the file back before surfacing the error; if even the
            // truncate fails the torn tail is discarded on next open.
            let _ = file.truncate(start);
            let _ = file.sync();
            return Err(e).wrap_err("failed to append journal frame");
        }

        self.frames.write().push(FrameMeta {
            tid,
            records_offset: start + BEGIN_SIZE as u64,
            records_len: (frame.len() - BEGIN_SIZE - COMMIT_SIZE) as u64,
        });
        Ok(())
    }

    /// Snapshot of frame locations with `tid` in `(after, up_to]`, in
    /// commit order.
    pub fn frames_in(&self, after: u64, up_to: u64) -> Vec<FrameMeta> {
        self.frames
            .read()
            .iter()
            .filter(|f| f.tid > after && f.tid <= up_to)
            .copied()
            .collect()
    }

    /// Reads one frame's records section via positioned reads.
    pub fn read_records(&self, meta: &FrameMeta) -> Result<Vec<u8>> {
        let file = self
            .file
            .as_ref()
            .expect("frame index entries imply a journal file");
        let mut buf = vec![0u8; meta.records_len as usize];
        file.read_exact_at(&mut buf, meta.records_offset)?;
        Ok(buf)
    }

    /// Empties the journal after a full checkpoint fold.
    pub fn truncate_to_zero(&self) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .expect("truncate on a read-only journal");
        let _guard = self.append.lock();

        file.truncate(0)?;
        file.sync()?;
        self.frames.write().clear();
        Ok(())
    }

    /// Releases the advisory lock and closes the file handle. The
    /// journal is unusable afterwards; only `close` paths call this.
    pub fn close_file(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.unlock()?;
        }
        self.frames.write().clear();
        Ok(())
    }
}

/// Walks the file classifying frames. Returns the frame index, the byte
/// length of the valid prefix, and whether a torn tail follows it.
fn scan(file: &File) -> Result<(Vec<FrameMeta>, u64, bool)> {
    let file_len = file.len()?;
    let mut frames = Vec::new();
    let mut offset = 0u64;
    let mut prev_tid = 0u64;

    while offset < file_len {
        if offset + BEGIN_SIZE as u64 > file_len {
            return Ok((frames, offset, true));
        }

        let mut begin_bytes = [0u8; BEGIN_SIZE];
        file.read_exact_at(&mut begin_bytes, offset)?;
        let begin = BeginRecord::read_from_bytes(&begin_bytes)
            .expect("BeginRecord is unaligned and sized to the buffer");

        let records_len = begin.length.get();
        let frame_end = offset + BEGIN_SIZE as u64 + records_len + COMMIT_SIZE as u64;
        if frame_end > file_len {
            return Ok((frames, offset, true));
        }

        if begin.tag.get() != TAG_BEGIN {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("bad frame tag at offset {}", offset)));
        }

        let mut commit_bytes = [0u8; COMMIT_SIZE];
        file.read_exact_at(&mut commit_bytes, frame_end - COMMIT_SIZE as u64)?;
        if u64::from_le_bytes(commit_bytes) != TAG_COMMIT {
            // A frame whose declared extent fits but does not end in
            // Commit is a torn append only when nothing follows it.
            if frame_end == file_len {
                return Ok((frames, offset, true));
            }
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("missing commit record at offset {}", offset)));
        }

        let tid = begin.tid.get();
        if tid == 0 || tid <= prev_tid {
            return Err(eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("non-monotonic tid {} at offset {}", tid, offset)));
        }
        prev_tid = tid;

        frames.push(FrameMeta {
            tid,
            records_offset: offset + BEGIN_SIZE as u64,
            records_len,
        });
        offset = frame_end;
    }

    Ok((frames, offset, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frame_bytes(tid: u64, build: impl FnOnce(&mut LogBuffer)) -> Vec<u8> {
        let mut log = LogBuffer::new();
        log.reset(tid);
        build(&mut log);
        log.finalize(tid).unwrap().to_vec()
    }

    fn open_rw(dir: &Directory) -> Journal {
        Journal::open(dir, "test.journal", false).unwrap()
    }

    #[test]
    fn append_then_scan_recovers_frames() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        {
            let journal = open_rw(&dir);
            journal
                .append_frame(1, &frame_bytes(1, |log| log.push_alloc(5).unwrap()))
                .unwrap();
            journal
                .append_frame(2, &frame_bytes(2, |log| log.push_free(5).unwrap()))
                .unwrap();
        }

        let journal = open_rw(&dir);

        assert_eq!(journal.last_commit_tid(), Some(2));
        let frames = journal.frames_in(0, u64::MAX);
        assert_eq!(frames.len(), 2);

        let bytes = journal.read_records(&frames[0]).unwrap();
        assert_eq!(parse_records(&bytes).unwrap(), vec![Record::Alloc(5)]);
    }

    #[test]
    fn diff_records_roundtrip_through_a_frame() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let journal = open_rw(&dir);

        let old = [0u8; BLOCK_SIZE];
        let mut new = old;
        new[17] = 0xEE;
        journal
            .append_frame(1, &frame_bytes(1, |log| log.push_diff(9, &old, &new).unwrap()))
            .unwrap();

        let frames = journal.frames_in(0, 1);
        let bytes = journal.read_records(&frames[0]).unwrap();
        let records = parse_records(&bytes).unwrap();

        match &records[0] {
            Record::Diff { block_id, payload } => {
                assert_eq!(*block_id, 9);
                let mut image = old;
                crate::diff::apply(&mut image, payload).unwrap();
                assert_eq!(image, new);
            }
            other => panic!("expected diff record, got {:?}", other),
        }
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let good_len;
        {
            let journal = open_rw(&dir);
            let frame = frame_bytes(1, |log| log.push_alloc(3).unwrap());
            journal.append_frame(1, &frame).unwrap();
            good_len = journal.len().unwrap();

            // Simulate a crash mid-append: a second frame missing its
            // tail.
            let torn = frame_bytes(2, |log| log.push_alloc(4).unwrap());
            let file = dir.open_file("test.journal", false).unwrap();
            file.write_all_at(&torn[..torn.len() - 11], good_len).unwrap();
            file.sync().unwrap();
        }

        let journal = open_rw(&dir);

        assert_eq!(journal.last_commit_tid(), Some(1));
        assert_eq!(journal.len().unwrap(), good_len);
    }

    #[test]
    fn corrupt_interior_frame_fails_open() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        {
            let journal = open_rw(&dir);
            journal
                .append_frame(1, &frame_bytes(1, |log| log.push_alloc(3).unwrap()))
                .unwrap();
            journal
                .append_frame(2, &frame_bytes(2, |log| log.push_alloc(4).unwrap()))
                .unwrap();

            // Stomp the first frame's commit tag while the second frame
            // still follows it.
            let file = dir.open_file("test.journal", false).unwrap();
            file.write_all_at(&0xDEADu64.to_le_bytes(), 40).unwrap();
            file.sync().unwrap();
        }

        let err = Journal::open(&dir, "test.journal", false).unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::Corrupt));
    }

    #[test]
    fn second_writer_is_refused() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let _first = open_rw(&dir);

        let err = Journal::open(&dir, "test.journal", false).unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::Busy));
    }

    #[test]
    fn read_only_open_skips_the_lock() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let writer = open_rw(&dir);
        writer
            .append_frame(1, &frame_bytes(1, |log| log.push_alloc(3).unwrap()))
            .unwrap();

        let reader = Journal::open(&dir, "test.journal", true).unwrap();

        assert_eq!(reader.last_commit_tid(), Some(1));
    }

    #[test]
    fn empty_frame_is_valid() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let journal = open_rw(&dir);

        journal.append_frame(1, &frame_bytes(1, |_| {})).unwrap();

        let frames = journal.frames_in(0, 1);
        assert_eq!(frames[0].records_len, 0);
    }

    #[test]
    fn truncate_to_zero_clears_the_index() {
        let tmp = tempdir().unwrap();
        let dir = Directory::open(tmp.path()).unwrap();
        let journal = open_rw(&dir);
        journal
            .append_frame(1, &frame_bytes(1, |log| log.push_alloc(3).unwrap()))
            .unwrap();

        journal.truncate_to_zero().unwrap();

        assert!(journal.is_empty().unwrap());
        assert_eq!(journal.last_commit_tid(), None);
    }
}
