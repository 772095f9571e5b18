//! Concurrent writers, readers and rotations.

use countstore::{CountsSink, CountsStore, KeyPrefix, StoreConfig, TxId, ANY_LABEL};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

fn test_store(dir: &TempDir) -> Arc<CountsStore> {
    init_tracing();
    Arc::new(
        CountsStore::open_or_create(StoreConfig {
            path: dir.path().join("counts"),
            background_rotation: false,
            merge_wait_timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .unwrap(),
    )
}

#[test]
fn test_commits_are_serialized_in_tx_order() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let threads = 4u64;
    let per_thread = 50u64;

    // Thread t owns tx ids 2 + t, 2 + t + threads, ... and commits them in
    // whatever order the scheduler allows; the gate orders them.
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let tx = TxId(2 + t + i * threads);
                    store
                        .with_updater(tx, |updater| {
                            updater.increment_node_count(ANY_LABEL, 1);
                            updater.increment_node_count(t as i32, 1);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.watermark(), TxId(1 + threads * per_thread));
    assert_eq!(
        store.node_count(ANY_LABEL).unwrap(),
        (threads * per_thread) as i64
    );
    for t in 0..threads {
        assert_eq!(store.node_count(t as i32).unwrap(), per_thread as i64);
    }
}

#[test]
fn test_reader_never_sees_partial_transaction() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let done = Arc::new(AtomicBool::new(false));

    // Each transaction moves one node from label 1 to label 2 and back, so
    // the sum over both labels is always 10.
    store
        .with_updater(TxId(2), |updater| {
            updater.increment_node_count(1, 10);
            Ok(())
        })
        .unwrap();

    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0u64;
            while !done.load(Ordering::Relaxed) {
                let entries: Vec<_> = store
                    .scan(KeyPrefix::Nodes)
                    .map(|entry| entry.unwrap())
                    .collect();
                let total: i64 = entries.iter().map(|e| e.count).sum();
                assert_eq!(total, 10);
                reads += 1;
            }
            reads
        })
    };

    for i in 0..200u64 {
        let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
        store
            .with_updater(TxId(3 + i), |updater| {
                updater.increment_node_count(from, -1);
                updater.increment_node_count(to, 1);
                Ok(())
            })
            .unwrap();
        if i % 25 == 0 {
            store.checkpoint().unwrap();
        }
    }
    done.store(true, Ordering::Relaxed);

    assert!(reader.join().unwrap() > 0);
    assert_eq!(store.node_count(1).unwrap(), 10);
}

#[test]
fn test_concurrent_checkpoints_and_commits() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let next_tx = Arc::new(AtomicU64::new(2));
    let total = 400u64;

    let writers: Vec<_> = (0..3)
        .map(|_| {
            let store = Arc::clone(&store);
            let next_tx = Arc::clone(&next_tx);
            thread::spawn(move || loop {
                let tx = next_tx.fetch_add(1, Ordering::SeqCst);
                if tx >= 2 + total {
                    break;
                }
                store
                    .with_updater(TxId(tx), |updater| {
                        updater.increment_node_count(ANY_LABEL, 1);
                        updater.increment_relationship_count(ANY_LABEL, (tx % 5) as i32, ANY_LABEL, 1);
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();

    let checkpointers: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..20 {
                    store.checkpoint().unwrap();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(checkpointers) {
        handle.join().unwrap();
    }
    store.checkpoint().unwrap();

    assert_eq!(store.watermark(), TxId(1 + total));
    assert_eq!(store.durable_watermark(), TxId(1 + total));
    assert_eq!(store.node_count(ANY_LABEL).unwrap(), total as i64);
    let per_type: i64 = (0..5)
        .map(|t| store.relationship_count(ANY_LABEL, t, ANY_LABEL).unwrap())
        .sum();
    assert_eq!(per_type, total as i64);
    assert_eq!(store.stats().failed_rotations, 0);
}

#[test]
fn test_background_rotation_under_load() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = CountsStore::open_or_create(StoreConfig {
        path: dir.path().join("counts"),
        max_diff_entries: 16,
        ..Default::default()
    })
    .unwrap();

    for tx in 2..1000u64 {
        store
            .with_updater(TxId(tx), |updater| {
                updater.increment_node_count((tx % 64) as i32, 1);
                Ok(())
            })
            .unwrap();
    }

    let counted: i64 = (0..64).map(|label| store.node_count(label).unwrap()).sum();
    assert_eq!(counted, 998);
    store.close();
}
