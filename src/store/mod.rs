//! The block store core.
//!
//! [`BlockStore`] composes the file layer, diff journal, version cache,
//! and transaction bookkeeping into the public surface: snapshot reads
//! (`begin_read` / `get_block` / `end_read`), the serialized write slot
//! (`begin_write` / `update_block` / `alloc_block` / `free_block` /
//! `commit_write` / `rollback_write`), and the checkpoint that folds
//! committed journal prefixes into the store file.
//!
//! ## On-disk layout
//!
//! ```text
//! <store>              block 0 = header, block N at offset N * 4096
//! <store>.journal      append-only frames, one per committed write
//! <store>.checkpoint   present only mid-checkpoint or after a crash
//! ```
//!
//! ## How a read works
//!
//! `get_block(id, tid)` probes the cache for the newest image at or
//! before `tid`; on a miss it loads the materialized image from the
//! store file, then replays journal frames in `(start, tid]` that touch
//! the block (`Alloc` resets to zero, `Free` marks it unreadable, `Diff`
//! patches bytes), caches the result, and returns it. A reader therefore
//! sees exactly the state committed by tids `<= tid`, regardless of what
//! the writer is doing.
//!
//! ## Lock order
//!
//! Write slot, then journal append lock, then tid-table/cache locks.
//! Every path acquires in that order, so the store is deadlock-free.
//!
//! ## Read-only stores
//!
//! A read-only handle is the same type with the write paths returning
//! `ReadOnly`. It takes no journal lock, never mutates the store file,
//! and applies a pending checkpoint virtually through an in-memory
//! overlay.

mod checkpoint;
mod header;
mod freelist;

pub use checkpoint::{CheckpointData, CheckpointEntry};
pub use header::StoreHeader;
pub use freelist::TrunkBlock;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::{MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{Block, BlockSpan, VersionCache};
use crate::config::{StoreConfig, BLOCK_SIZE, CLOSE_CHECKPOINT_DEADLINE};
use crate::diff;
use crate::error::StoreError;
use crate::fs::{Directory, File};
use crate::journal::{self, Journal, Record};
use crate::txn::{Tid, TidTable, WriteGate, WriteSlot};

/// State of the materialized store file: which blocks exist, which are
/// free as of `first_transaction`, and (read-only mode only) the
/// virtual overlay from a pending checkpoint, each entry an image plus
/// its freed marker.
#[derive(Debug)]
struct Materialized {
    block_count: u64,
    free: HashSet<u64>,
    overlay: HashMap<u64, (Block, bool)>,
}

#[derive(Debug)]
pub struct BlockStore {
    dir: Directory,
    journal_name: String,
    checkpoint_name: String,
    checkpoint_tmp_name: String,
    read_only: bool,
    config: StoreConfig,
    store_file: File,
    journal: Journal,
    cache: VersionCache,
    ids: RwLock<TidTable>,
    gate: WriteGate,
    materialized: RwLock<Materialized>,
}

fn read_materialized(
    overlay: &HashMap<u64, (Block, bool)>,
    store_file: &File,
    block_id: u64,
) -> Result<Block> {
    if let Some((image, _)) = overlay.get(&block_id) {
        return Ok(image.clone());
    }
    let mut buf = [0u8; BLOCK_SIZE];
    store_file.read_exact_at(&mut buf, block_id * BLOCK_SIZE as u64)?;
    Ok(Block::from_array(buf))
}

impl BlockStore {
    /// Initializes a new store at `path` (truncating any existing file)
    /// and opens it read/write.
    pub fn create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path, true)?;
        let mut block0 = [0u8; BLOCK_SIZE];
        StoreHeader::init(&mut block0);
        file.write_all_at(&block0, 0)?;
        file.sync()?;
        drop(file);

        Self::open_with(path, false, config)
    }

    /// Opens an existing store with default configuration. A missing
    /// store reports `NotFound`; a second writer reports `Busy`.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        Self::open_with(path, read_only, StoreConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        config: StoreConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .ok_or_else(|| eyre::Report::new(StoreError::Invalid))
            .wrap_err("store path has no file name")?
            .to_string_lossy()
            .into_owned();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = Directory::open(&parent)?;
        let journal_name = format!("{name}.journal");
        let checkpoint_name = format!("{name}.checkpoint");
        let checkpoint_tmp_name = format!("{name}.checkpoint.tmp");

        let store_file = dir.open_file(&name, read_only)?;

        // The journal's exclusive lock is what refuses a second writer;
        // it must be held before any recovery artifact is touched, or
        // two racing opens could both apply and remove the pending
        // checkpoint.
        let journal = Journal::open(&dir, &journal_name, read_only)?;

        // A temp side file never carries authority; it predates the
        // rename that makes a checkpoint real.
        if !read_only && dir.exists(&checkpoint_tmp_name) {
            let _ = dir.remove_file(&checkpoint_tmp_name);
        }

        let mut overlay: HashMap<u64, (Block, bool)> = HashMap::new();
        if dir.exists(&checkpoint_name) {
            match checkpoint::load(&dir, &checkpoint_name) {
                Ok(data) => {
                    if read_only {
                        info!(store = %name, "applying pending checkpoint virtually");
                        for entry in data.entries {
                            overlay.insert(entry.block_id, (entry.image, entry.freed));
                        }
                    } else {
                        info!(store = %name, "completing interrupted checkpoint");
                        checkpoint::apply(&store_file, &data)?;
                        dir.remove_file(&checkpoint_name)?;
                        dir.sync()?;
                    }
                }
                Err(e) if StoreError::of(&e) == Some(StoreError::Corrupt) => {
                    warn!(
                        store = %name,
                        "discarding partial checkpoint file; journal is authoritative"
                    );
                    if !read_only {
                        dir.remove_file(&checkpoint_name)?;
                        dir.sync()?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let block0 = read_materialized(&overlay, &store_file, 0)
            .wrap_err("failed to read store header")?;
        let header = StoreHeader::validate(block0.as_array())?;
        let first = header.first_transaction();
        let mut last = header.last_transaction();
        let free = freelist::materialized_free_set(header, |id| {
            read_materialized(&overlay, &store_file, id)
        })?;
        let block_count = store_file.len()? / BLOCK_SIZE as u64;

        if let Some(journal_last) = journal.last_commit_tid() {
            last = last.max(journal_last);
        }
        if first > last {
            return Err(eyre::Report::new(StoreError::Corrupt).wrap_err(format!(
                "store watermarks are inverted: first {} > last {}",
                first, last
            )));
        }

        debug!(store = %name, first, last, block_count, read_only, "store opened");

        let store = Self {
            dir,
            journal_name,
            checkpoint_name,
            checkpoint_tmp_name,
            read_only,
            store_file,
            journal,
            cache: VersionCache::new(config.cache_capacity),
            config,
            ids: RwLock::new(TidTable::new(first, last)),
            gate: WriteGate::new(),
            materialized: RwLock::new(Materialized {
                block_count,
                free,
                overlay,
            }),
        };

        if !store.read_only {
            // Fold whatever the journal already holds; failure is not
            // fatal, the next commit or close will retry.
            let slot = store.gate.lock();
            if let Err(e) = store.do_checkpoint() {
                warn!(error = %e, "checkpoint on open failed");
            }
            drop(slot);
        }

        Ok(store)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Most recent committed transaction.
    pub fn last_transaction(&self) -> Tid {
        self.ids.read().last_transaction
    }

    /// Oldest transaction whose journal records have not been folded
    /// into the store file.
    pub fn first_transaction(&self) -> Tid {
        self.ids.read().first_transaction
    }

    /// Registers a snapshot reader and returns its tid. The journal
    /// keeps everything needed to reconstruct any block at that tid
    /// until `end_read` releases it.
    pub fn begin_read(&self) -> Tid {
        self.ids.write().begin_read()
    }

    /// Releases a reader. Unknown tids report `Invalid`.
    pub fn end_read(&self, tid: Tid) -> Result<()> {
        self.ids.write().end_read(tid)
    }

    /// Claims the write slot and returns the provisional tid
    /// (`last_transaction + 1`). The tid only becomes durable at
    /// `commit_write`; `rollback_write` discards it.
    pub fn begin_write(&self, timeout: Duration) -> Result<Tid> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.gate.acquire(deadline)?;
        let tid = self.ids.read().last_transaction + 1;
        slot.arm(tid);
        Ok(tid)
    }

    /// Durably commits the in-progress transaction: the frame is
    /// appended to the journal and fsynced before the tid is published.
    /// On any append failure the journal is wound back and the
    /// transaction is discarded as if rolled back.
    pub fn commit_write(&self, tid: Tid) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        let mut slot = self.writer(tid)?;

        let append_result = {
            let frame = slot.log.finalize(tid);
            match frame {
                Ok(frame) => self.journal.append_frame(tid, frame),
                Err(e) => Err(e),
            }
        };

        if let Err(e) = append_result {
            self.purge_provisional(&slot, tid);
            slot.disarm();
            drop(slot);
            self.gate.signal();
            return Err(e).wrap_err_with(|| format!("commit of tid {} failed; rolled back", tid));
        }

        self.ids.write().last_transaction = tid;

        let journal_len = self.journal.len().unwrap_or(0);
        if tid % self.config.checkpoint_interval == 0 || journal_len > self.config.journal_soft_cap
        {
            if let Err(e) = self.do_checkpoint() {
                // The commit is durable in the journal either way.
                warn!(tid, error = %e, "inline checkpoint failed");
            }
        }

        slot.disarm();
        drop(slot);
        self.gate.signal();
        Ok(())
    }

    /// Discards the in-progress transaction. Nothing reaches the
    /// journal; the provisional tid will be reissued to the next
    /// writer. A mismatched tid or an idle slot is a no-op.
    pub fn rollback_write(&self, tid: Tid) {
        let mut slot = self.gate.lock();
        let expected = self.ids.read().last_transaction + 1;
        if slot.in_progress && tid == expected {
            self.purge_provisional(&slot, tid);
            slot.disarm();
            drop(slot);
            self.gate.signal();
        }
    }

    /// Evicts every cache entry the aborting transaction inserted under
    /// its provisional tid; the tid will be reissued to the next writer.
    fn purge_provisional(&self, slot: &WriteSlot, tid: Tid) {
        for &block_id in slot.touched.iter() {
            self.cache.remove(&BlockSpan::new(block_id, tid));
        }
    }

    /// Reads the image of `block_id` as of `tid`. Freed blocks report
    /// `NotFound`; tids outside `[first_transaction, last_transaction]`
    /// (or zero, or block 0) report `Invalid`.
    pub fn get_block(&self, block_id: u64, tid: Tid) -> Result<Block> {
        if block_id == 0 || tid == 0 {
            return Err(eyre::Report::new(StoreError::Invalid)
                .wrap_err("block 0 and tid 0 are reserved"));
        }
        {
            let ids = self.ids.read();
            if tid > ids.last_transaction {
                return Err(eyre::Report::new(StoreError::Invalid).wrap_err(format!(
                    "tid {} is beyond the last commit {}",
                    tid, ids.last_transaction
                )));
            }
            if tid < ids.first_transaction {
                return Err(eyre::Report::new(StoreError::Invalid).wrap_err(format!(
                    "tid {} predates the checkpoint fold at {}",
                    tid, ids.first_transaction
                )));
            }
        }

        let (block, freed) = self.get_block_i(block_id, tid)?;
        if freed {
            return Err(eyre::Report::new(StoreError::NotFound)
                .wrap_err(format!("block {} is freed at tid {}", block_id, tid)));
        }
        Ok(block)
    }

    /// Records a full-image update of `block_id` in the in-progress
    /// transaction and makes it visible to the writer's own reads.
    pub fn update_block(&self, block_id: u64, tid: Tid, image: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        if block_id == 0 {
            return Err(eyre::Report::new(StoreError::Invalid).wrap_err("block 0 is reserved"));
        }
        let new_block = Block::from_bytes(image)?;
        let mut slot = self.writer(tid)?;

        // Diff against the newest image at this tid: the writer's own
        // in-transaction version when it already touched the block,
        // otherwise the committed image.
        let (prev, freed) = self.get_block_i(block_id, tid)?;
        if freed {
            return Err(eyre::Report::new(StoreError::NotFound)
                .wrap_err(format!("cannot update freed block {}", block_id)));
        }

        slot.log.push_diff(block_id, prev.as_array(), new_block.as_array())?;
        self.cache
            .insert(BlockSpan::new(block_id, tid), new_block, false);
        slot.note_touched(block_id);
        Ok(())
    }

    /// Allocates a block inside the in-progress transaction and returns
    /// its id together with the zero image it now holds. Ids come from
    /// the block-0 free stack, then the trunk chain, then by extending
    /// the store.
    pub fn alloc_block(&self, tid: Tid) -> Result<(u64, Block)> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        let mut slot = self.writer(tid)?;

        let (block0, _) = self.get_block_i(0, tid)?;
        let mut block0_new = block0.clone();

        let (head, stacked) = {
            let header = StoreHeader::view(block0.as_array());
            (header.free_list_head_block(), header.free_count())
        };

        let block_id;
        if stacked > 0 {
            block_id = StoreHeader::view_mut(block0_new.make_mut())
                .pop_free()
                .expect("free stack is non-empty");
        } else if head != 0 {
            let (trunk_img, _) = self.get_block_i(head, tid)?;
            let trunk = TrunkBlock::view(trunk_img.as_array());
            if trunk.is_empty() {
                // An exhausted trunk is itself the next allocation.
                block_id = head;
                StoreHeader::view_mut(block0_new.make_mut())
                    .set_free_list_head_block(trunk.next_trunk());
            } else {
                let mut trunk_new = trunk_img.clone();
                block_id = TrunkBlock::view_mut(trunk_new.make_mut())
                    .pop()
                    .expect("trunk is non-empty");
                slot.log
                    .push_diff(head, trunk_img.as_array(), trunk_new.as_array())?;
                self.cache.insert(BlockSpan::new(head, tid), trunk_new, true);
                slot.note_touched(head);
            }
        } else {
            let header = StoreHeader::view_mut(block0_new.make_mut());
            block_id = header.next_block_id();
            header.set_next_block_id(block_id + 1);
        }

        if block0_new != block0 {
            slot.log
                .push_diff(0, block0.as_array(), block0_new.as_array())?;
            self.cache.insert(BlockSpan::new(0, tid), block0_new, false);
            slot.note_touched(0);
        }

        slot.log.push_alloc(block_id)?;
        let zero = Block::zero();
        self.cache
            .insert(BlockSpan::new(block_id, tid), zero.clone(), false);
        slot.note_touched(block_id);
        Ok((block_id, zero))
    }

    /// Frees a block inside the in-progress transaction. Earlier
    /// readers keep seeing the old image; reads at or after this tid
    /// report `NotFound` until the id is reallocated.
    pub fn free_block(&self, block_id: u64, tid: Tid) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        if block_id == 0 {
            return Err(eyre::Report::new(StoreError::Invalid).wrap_err("block 0 is reserved"));
        }
        let mut slot = self.writer(tid)?;

        let (prev, freed) = self.get_block_i(block_id, tid)?;
        if freed {
            return Err(eyre::Report::new(StoreError::NotFound)
                .wrap_err(format!("block {} is already free", block_id)));
        }

        slot.log.push_free(block_id)?;

        let (block0, _) = self.get_block_i(0, tid)?;
        let mut block0_new = block0.clone();

        if StoreHeader::view(block0.as_array()).stack_is_full() {
            // The freed block becomes a trunk absorbing the stack.
            let header = StoreHeader::view_mut(block0_new.make_mut());
            let absorbed = header.drain_stack();
            let trunk_img = TrunkBlock::build(header.free_list_head_block(), &absorbed);
            header.set_free_list_head_block(block_id);
            slot.log
                .push_diff(block_id, prev.as_array(), trunk_img.as_array())?;
            self.cache
                .insert(BlockSpan::new(block_id, tid), trunk_img, true);
        } else {
            StoreHeader::view_mut(block0_new.make_mut()).push_free(block_id);
            self.cache.insert(BlockSpan::new(block_id, tid), prev, true);
        }
        slot.note_touched(block_id);

        slot.log
            .push_diff(0, block0.as_array(), block0_new.as_array())?;
        self.cache.insert(BlockSpan::new(0, tid), block0_new, false);
        slot.note_touched(0);
        Ok(())
    }

    /// Folds committed journal frames up to the horizon (the oldest
    /// live reader, or the last commit when none) into the store file,
    /// then advances `first_transaction`. With everything folded and no
    /// readers the journal is truncated to zero.
    pub fn checkpoint(&self, timeout: Duration) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(StoreError::ReadOnly));
        }
        let deadline = Instant::now().checked_add(timeout);
        let slot = self.gate.acquire(deadline)?;
        let result = self.do_checkpoint();
        drop(slot);
        self.gate.signal();
        result
    }

    /// Final checkpoint, then (when everything folded) removal of the
    /// journal file. A failed checkpoint leaves the journal for the
    /// next open.
    pub fn close(mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        match self.checkpoint(CLOSE_CHECKPOINT_DEADLINE) {
            Ok(()) => {
                let fully_folded = {
                    let ids = self.ids.read();
                    ids.first_transaction == ids.last_transaction && !ids.has_readers()
                };
                if fully_folded {
                    self.journal.close_file()?;
                    if self.dir.exists(&self.journal_name) {
                        self.dir.remove_file(&self.journal_name)?;
                        self.dir.sync()?;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "final checkpoint failed; journal left in place");
            }
        }
        Ok(())
    }

    /// Verifies the caller holds the write slot with the expected tid.
    fn writer(&self, tid: Tid) -> Result<MutexGuard<'_, WriteSlot>> {
        let slot = self.gate.lock();
        let expected = self.ids.read().last_transaction + 1;
        if !slot.in_progress || tid != expected {
            return Err(eyre::Report::new(StoreError::NotWriter).wrap_err(format!(
                "tid {} is not the in-progress write transaction",
                tid
            )));
        }
        Ok(slot)
    }

    /// Materialized image and freed-ness of a block, ignoring the
    /// journal. Freed blocks keep their bytes: trunk blocks hold live
    /// free-list data, and diffs against a freed block chain from its
    /// real content.
    fn load_block_raw(&self, block_id: u64) -> Result<(Block, bool)> {
        let mat = self.materialized.read();
        if let Some((image, freed)) = mat.overlay.get(&block_id) {
            return Ok((image.clone(), *freed));
        }
        if block_id >= mat.block_count {
            return Ok((Block::zero(), true));
        }
        let freed = mat.free.contains(&block_id);
        drop(mat);

        let mut buf = [0u8; BLOCK_SIZE];
        self.store_file
            .read_exact_at(&mut buf, block_id * BLOCK_SIZE as u64)?;
        Ok((Block::from_array(buf), freed))
    }

    /// The cache-probe / load / replay pipeline shared by readers and
    /// the writer's internal lookups (which pass the provisional tid
    /// and may observe freed trunk blocks).
    fn get_block_i(&self, block_id: u64, tid: Tid) -> Result<(Block, bool)> {
        let last = self.ids.read().last_transaction;

        let (mut image, mut freed, start) = match self.cache.find_nearest_before(block_id, tid) {
            Some((span, state)) => {
                if span.start_trans_id == tid {
                    return Ok((state.block, state.freed));
                }
                (state.block, state.freed, span.start_trans_id)
            }
            None => {
                let first = self.ids.read().first_transaction;
                let (image, freed) = self.load_block_raw(block_id)?;
                (image, freed, first)
            }
        };

        if start < tid {
            for meta in self.journal.frames_in(start, tid) {
                let bytes = self.journal.read_records(&meta)?;
                for record in journal::parse_records(&bytes)? {
                    if record.block_id() != block_id {
                        continue;
                    }
                    match record {
                        Record::Alloc(_) => {
                            image = Block::zero();
                            freed = false;
                        }
                        Record::Free(_) => {
                            freed = true;
                        }
                        Record::Diff { payload, .. } => {
                            diff::apply(image.make_mut(), payload).wrap_err_with(|| {
                                format!(
                                    "journal frame {} carries a bad diff for block {}",
                                    meta.tid, block_id
                                )
                            })?;
                        }
                    }
                }
            }
        }

        // Cache under the committed portion only: a writer's replay at
        // the provisional tid reflects state at `last`, and the
        // provisional tid may yet be rolled back and reissued.
        let insert_tid = tid.min(last);
        if insert_tid > 0 {
            self.cache
                .insert(BlockSpan::new(block_id, insert_tid), image.clone(), freed);
        }
        Ok((image, freed))
    }

    fn do_checkpoint(&self) -> Result<()> {
        let (first, last, horizon) = {
            let ids = self.ids.read();
            (ids.first_transaction, ids.last_transaction, ids.horizon())
        };
        if horizon <= first {
            return Ok(());
        }

        let result = self.fold(last, horizon, first);
        if result.is_err() {
            let _ = self.dir.remove_file(&self.checkpoint_tmp_name);
            if self.dir.exists(&self.checkpoint_name) {
                let _ = self.dir.remove_file(&self.checkpoint_name);
            }
        }
        result
    }

    fn fold(&self, last: Tid, horizon: Tid, first: Tid) -> Result<()> {
        let frames = self.journal.frames_in(first, horizon);
        debug!(first, horizon, frames = frames.len(), "checkpoint starting");

        // Final image (and freed-ness) of every block touched in the
        // fold range, replayed over the materialized base.
        let mut images: HashMap<u64, (Block, bool)> = HashMap::new();
        for meta in &frames {
            let bytes = self.journal.read_records(meta)?;
            for record in journal::parse_records(&bytes)? {
                let id = record.block_id();
                if !images.contains_key(&id) {
                    let base = self.load_block_raw(id)?;
                    images.insert(id, base);
                }
                let entry = images.get_mut(&id).expect("inserted above");
                match record {
                    Record::Alloc(_) => {
                        entry.0 = Block::zero();
                        entry.1 = false;
                    }
                    Record::Free(_) => {
                        entry.1 = true;
                    }
                    Record::Diff { payload, .. } => {
                        diff::apply(entry.0.make_mut(), payload).wrap_err_with(|| {
                            format!("frame {} carries a bad diff for block {}", meta.tid, id)
                        })?;
                    }
                }
            }
        }

        let mut block0 = match images.remove(&0) {
            Some((image, _)) => image,
            None => self.load_block_raw(0)?.0,
        };
        {
            let header = StoreHeader::view_mut(block0.make_mut());
            header.set_first_transaction(horizon);
            header.set_last_transaction(last);
            header.seal();
        }

        let mut entries = Vec::with_capacity(images.len() + 1);
        entries.push(CheckpointEntry {
            block_id: 0,
            freed: false,
            image: block0,
        });
        let mut touched: Vec<_> = images.into_iter().collect();
        touched.sort_unstable_by_key(|(id, _)| *id);
        for (block_id, (image, freed)) in touched {
            entries.push(CheckpointEntry {
                block_id,
                freed,
                image,
            });
        }

        let data = CheckpointData {
            first_transaction: horizon,
            last_transaction: last,
            entries,
        };
        checkpoint::write(
            &self.dir,
            &self.checkpoint_tmp_name,
            &self.checkpoint_name,
            &data,
        )?;
        checkpoint::apply(&self.store_file, &data)?;

        // Publish the new materialized state before the journal is
        // allowed to shrink.
        {
            let mut mat = self.materialized.write();
            for entry in &data.entries {
                if entry.freed {
                    mat.free.insert(entry.block_id);
                } else {
                    mat.free.remove(&entry.block_id);
                }
                mat.block_count = mat.block_count.max(entry.block_id + 1);
            }
        }
        self.ids.write().first_transaction = horizon;

        self.dir.remove_file(&self.checkpoint_name)?;
        self.dir.sync()?;

        let fully_folded = {
            let ids = self.ids.read();
            ids.first_transaction == ids.last_transaction && !ids.has_readers()
        };
        if fully_folded {
            self.journal.truncate_to_zero()?;
        }

        debug!(horizon, fully_folded, "checkpoint complete");
        Ok(())
    }
}
