//! Readers on other threads always see a whole commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::Store;

const COMMITS: u64 = 60;

/// Commit `i` adds relationship `i` and counts one triple.
fn writer(store: &Store, done: &AtomicBool) {
    for i in 1..=COMMITS {
        let mut txn = store.begin_write().expect("begin");
        txn.add_related_resource(&relationship(1, 1, 0, i)).expect("add");
        txn.record_triples_added("p", 1).expect("record");
        txn.commit().expect("commit");
    }
    done.store(true, Ordering::Release);
}

fn reader(store: &Store, done: &AtomicBool) -> usize {
    let mut snapshots = 0;
    let mut last_seen = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        let read = store.read().expect("read");
        let commit = read.transaction_id();
        assert!(commit >= last_seen, "head went backwards");
        last_seen = commit;

        let related = read.enumerate_related(1, 1, None).expect("enumerate");
        assert_eq!(related.len() as u64, commit);
        let total = read
            .statistics()
            .expect("statistics")
            .map_or(0, |record| record.total_triple_count);
        assert_eq!(total, commit);
        snapshots += 1;

        if finished {
            assert_eq!(commit, COMMITS);
            return snapshots;
        }
    }
}

fn run(strategy: PersistenceStrategy) {
    let (store, _disk) = memory_store(100, small_config(strategy));
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| reader(&store, &done)))
            .collect();
        writer(&store, &done);
        for handle in readers {
            let snapshots = handle.join().expect("reader panicked");
            assert!(snapshots > 0);
        }
    });
}

#[test]
fn test_concurrent_readers_append_only() {
    run(PersistenceStrategy::AppendOnly);
}

#[test]
fn test_concurrent_readers_rewrite() {
    run(PersistenceStrategy::Rewrite);
}
