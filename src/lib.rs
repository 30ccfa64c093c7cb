//! # silt: a transactional, versioned block store
//!
//! silt persists fixed-size 4096-byte blocks addressed by 64-bit ids,
//! with snapshot-isolated readers and one serialized writer. It is the
//! storage substrate for higher-level structures (B-trees, indices);
//! those live above this crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │        BlockStore (store module)          │
//! │  get / update / alloc / free / checkpoint │
//! ├──────────────┬──────────────┬─────────────┤
//! │ VersionCache │  Journal     │ TidTable +  │
//! │ (MVCC reads) │  (WAL frames)│ WriteGate   │
//! ├──────────────┴──────────────┴─────────────┤
//! │        Diff codec (equal/literal runs)    │
//! ├───────────────────────────────────────────┤
//! │   File & Directory (positioned I/O, lock) │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## How writes become durable
//!
//! A write transaction buffers `Alloc`/`Free`/`Diff` records in memory;
//! `commit_write` appends them to `<store>.journal` as one frame and
//! fsyncs before publishing the tid. Readers reconstruct any historical
//! block by replaying committed frames over the materialized store
//! file. A checkpoint periodically folds frames up to the oldest live
//! reader into the store file through a hashed, renamed side file, so a
//! crash at any instant leaves either the journal or the side file
//! authoritative, never neither.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use silt::{BlockStore, StoreConfig};
//!
//! let store = BlockStore::create("data/example.silt", StoreConfig::default())?;
//!
//! let tid = store.begin_write(Duration::from_secs(1))?;
//! let (id, _zero) = store.alloc_block(tid)?;
//! store.update_block(id, tid, &[0xAA; 4096])?;
//! store.commit_write(tid)?;
//!
//! let read = store.begin_read();
//! let image = store.get_block(id, read)?;
//! store.end_read(read)?;
//! store.close()?;
//! ```
//!
//! ## Concurrency model
//!
//! Native threads only. Many concurrent readers; at most one writer per
//! process (the write slot), at most one writing process per store (the
//! journal's advisory file lock). `begin_write` and `checkpoint` accept
//! deadlines and fail with `Timeout`; nothing else blocks on the write
//! slot.

pub mod cache;
pub mod config;
pub mod diff;
pub mod error;
pub mod fs;
pub mod journal;
pub mod store;
pub mod txn;

pub use cache::{Block, BlockSpan, VersionCache};
pub use config::{StoreConfig, BLOCK_SIZE};
pub use error::StoreError;
pub use store::BlockStore;
pub use txn::Tid;
