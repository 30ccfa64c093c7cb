//! Multi-threaded behavior: writer exclusion, snapshot stability under
//! concurrent commits, reader protection of the checkpoint horizon, and
//! cross-handle writer rejection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use silt::{BlockStore, StoreConfig, StoreError, BLOCK_SIZE};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn filled(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

#[test]
fn at_most_one_writer_at_a_time() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        BlockStore::create(dir.path().join("test.silt"), StoreConfig::default()).unwrap(),
    );

    let in_write = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let in_write = Arc::clone(&in_write);
        let overlaps = Arc::clone(&overlaps);
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                let tid = store.begin_write(WAIT).unwrap();
                if in_write.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
                in_write.fetch_sub(1, Ordering::SeqCst);
                store.commit_write(tid).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(store.last_transaction(), 8 * 20);
}

#[test]
fn snapshots_stay_stable_under_concurrent_commits() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        BlockStore::create(dir.path().join("test.silt"), StoreConfig::default()).unwrap(),
    );

    let t1 = store.begin_write(WAIT).unwrap();
    let (id, _) = store.alloc_block(t1).unwrap();
    store.update_block(id, t1, &filled(1)).unwrap();
    store.commit_write(t1).unwrap();

    // Every commit fills the block with its own tid, so a reader at tid
    // r must always observe fill == r.
    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for tid in 2..=60u64 {
                let t = store.begin_write(WAIT).unwrap();
                assert_eq!(t, tid);
                store.update_block(id, t, &filled((t % 251) as u8)).unwrap();
                store.commit_write(t).unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        readers.push(thread::spawn(move || {
            for _ in 0..50 {
                let r = store.begin_read();
                let expected = filled((r % 251) as u8);
                for _ in 0..5 {
                    let image = store.get_block(id, r).unwrap();
                    assert_eq!(image.as_slice(), &expected[..]);
                }
                store.end_read(r).unwrap();
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn a_pinned_reader_blocks_horizon_advancement() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        checkpoint_interval: 4,
        ..StoreConfig::default()
    };
    let store = BlockStore::create(dir.path().join("test.silt"), config).unwrap();

    let t1 = store.begin_write(WAIT).unwrap();
    let (id, _) = store.alloc_block(t1).unwrap();
    store.update_block(id, t1, &filled(1)).unwrap();
    store.commit_write(t1).unwrap();

    for byte in 2..=4u8 {
        let t = store.begin_write(WAIT).unwrap();
        store.update_block(id, t, &filled(byte)).unwrap();
        store.commit_write(t).unwrap();
    }
    // The interval checkpoint at tid 4 folded everything.
    assert_eq!(store.first_transaction(), 4);

    let reader = store.begin_read();
    assert_eq!(reader, 4);

    for byte in 5..=12u8 {
        let t = store.begin_write(WAIT).unwrap();
        store.update_block(id, t, &filled(byte)).unwrap();
        store.commit_write(t).unwrap();
    }

    // Interval checkpoints at 8 and 12 ran, but the pinned reader held
    // the horizon at 4.
    assert_eq!(store.first_transaction(), 4);
    assert_eq!(store.get_block(id, reader).unwrap().as_slice(), &filled(4)[..]);

    store.end_read(reader).unwrap();
    store.checkpoint(WAIT).unwrap();
    assert_eq!(store.first_transaction(), 12);
}

#[test]
fn begin_write_times_out_behind_an_open_transaction() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        BlockStore::create(dir.path().join("test.silt"), StoreConfig::default()).unwrap(),
    );

    let tid = store.begin_write(WAIT).unwrap();

    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.begin_write(Duration::from_millis(50)).unwrap_err())
    };
    let err = blocked.join().unwrap();
    assert_eq!(StoreError::of(&err), Some(StoreError::Timeout));

    store.rollback_write(tid);

    // With the slot free the next begin_write succeeds immediately.
    let t = store.begin_write(Duration::from_millis(50)).unwrap();
    store.rollback_write(t);
}

#[test]
fn checkpoint_times_out_behind_an_open_transaction() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        BlockStore::create(dir.path().join("test.silt"), StoreConfig::default()).unwrap(),
    );

    let tid = store.begin_write(WAIT).unwrap();

    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.checkpoint(Duration::from_millis(50)).unwrap_err())
    };
    let err = blocked.join().unwrap();
    assert_eq!(StoreError::of(&err), Some(StoreError::Timeout));

    store.rollback_write(tid);
}

#[test]
fn second_write_handle_is_busy_but_read_only_succeeds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.silt");
    let first = BlockStore::create(&path, StoreConfig::default()).unwrap();

    let t1 = first.begin_write(WAIT).unwrap();
    let (id, _) = first.alloc_block(t1).unwrap();
    first.update_block(id, t1, &filled(0xAA)).unwrap();
    first.commit_write(t1).unwrap();

    let err = BlockStore::open(&path, false).unwrap_err();
    assert_eq!(StoreError::of(&err), Some(StoreError::Busy));

    let reader = BlockStore::open(&path, true).unwrap();
    assert_eq!(
        reader.get_block(id, reader.last_transaction()).unwrap().as_slice(),
        &filled(0xAA)[..]
    );
}
