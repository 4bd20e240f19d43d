//! Statistics records: text form and per-commit persistence.

use std::collections::BTreeMap;

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{
    MemoryStorage, PageId, STATISTICS_ROOT, StatisticsError, Store, StoreError,
    StoreStatisticsRecord,
};

fn sample() -> StoreStatisticsRecord {
    StoreStatisticsRecord::new(
        42,
        100,
        BTreeMap::from([("p1".to_string(), 60), ("p2".to_string(), 40)]),
    )
}

#[test]
fn test_record_save_and_load() {
    let mut buffer = Vec::new();
    sample().save(&mut buffer).expect("save");
    assert_eq!(buffer, b"42\n100\n60,p1\n40,p2\nEND\n");

    let loaded = StoreStatisticsRecord::load(&mut buffer.as_slice()).expect("load");
    assert_eq!(loaded, sample());
}

#[test]
fn test_truncated_record_reports_line() {
    let err = StoreStatisticsRecord::load(&mut &b"42\n100\n60,p1\n"[..]).expect_err("no END");
    assert!(matches!(err, StatisticsError::Format { line: 4, .. }));
}

#[test]
fn test_statistics_follow_commits() {
    let cfg = config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(20, cfg);

    let mut txn = store.begin_write().expect("begin");
    txn.record_triples_added("p1", 60).expect("record");
    txn.record_triples_added("p2", 40).expect("record");
    txn.commit().expect("commit");

    let mut txn = store.begin_write().expect("begin");
    txn.record_triples_removed("p2", 40).expect("record");
    txn.record_triples_added("p3", 5).expect("record");
    txn.commit().expect("commit");
    drop(store);

    let store = reopen(&disk, cfg);
    let read = store.read().expect("read");
    let latest = read.statistics().expect("statistics").expect("record");
    assert_eq!(latest.commit_number, 2);
    assert_eq!(latest.total_triple_count, 65);
    assert_eq!(
        latest.predicate_triple_counts,
        BTreeMap::from([("p1".to_string(), 60), ("p3".to_string(), 5)])
    );

    let history: Vec<_> = read
        .statistics_history()
        .into_iter()
        .map(|record| record.expect("record").total_triple_count)
        .collect();
    assert_eq!(history, vec![65, 100]);
}

#[test]
fn test_rewrite_store_keeps_latest_statistics_only() {
    let (store, _disk) = memory_store(21, config(PersistenceStrategy::Rewrite));
    for count in 1..=3 {
        let mut txn = store.begin_write().expect("begin");
        txn.record_triples_added("p", count).expect("record");
        txn.commit().expect("commit");
    }
    let read = store.read().expect("read");
    let history = read.statistics_history();
    assert_eq!(history.len(), 1);
    let latest = read.statistics().expect("statistics").expect("record");
    assert_eq!(latest.commit_number, 3);
    assert_eq!(latest.total_triple_count, 6);
}

/// Make the record stored on `page_id` unparsable while keeping its page
/// checksum valid.
#[allow(clippy::expect_used)]
fn garble_record(disk: &MemoryStorage, page_id: PageId, record: &StoreStatisticsRecord) {
    let mut text = Vec::new();
    record.save(&mut text).expect("save");
    let mut page = disk.peek(page_id).expect("statistics page");
    let start = page
        .as_bytes()
        .windows(text.len())
        .position(|window| window == text.as_slice())
        .expect("record text on page");
    page.as_bytes_mut()[start] = b'x';
    page.seal();
    disk.overwrite_durable(page_id, page);
}

fn commit_counts(store: &Store, counts: &[u64]) {
    for count in counts {
        let mut txn = store.begin_write().expect("begin");
        txn.record_triples_added("p", *count).expect("record");
        txn.commit().expect("commit");
    }
}

#[test]
fn test_malformed_record_does_not_hide_older_ones() {
    let cfg = config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(22, cfg);
    commit_counts(&store, &[1, 2, 3]);

    let middle = store.commit_points().expect("points")[1].clone();
    assert_eq!(middle.transaction_id, 2);
    let record = store
        .read_at(&middle)
        .expect("read")
        .statistics()
        .expect("statistics")
        .expect("record");
    garble_record(&disk, middle.root(STATISTICS_ROOT), &record);
    drop(store);

    let store = reopen(&disk, cfg);
    let read = store.read().expect("read");
    let history = read.statistics_history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].as_ref().expect("newest").total_triple_count, 6);
    assert!(matches!(
        history[1],
        Err(StoreError::Statistics(StatisticsError::Format { line: 1, .. }))
    ));
    assert_eq!(history[2].as_ref().expect("oldest").commit_number, 1);
}

#[test]
fn test_writes_continue_after_newest_record_is_damaged() {
    let cfg = config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(23, cfg);
    commit_counts(&store, &[10, 20]);

    let head = store.head();
    let record = store.read().expect("read").statistics().expect("statistics").expect("record");
    garble_record(&disk, head.root(STATISTICS_ROOT), &record);
    drop(store);

    let store = reopen(&disk, cfg);
    assert!(matches!(
        store.read().expect("read").statistics(),
        Err(StoreError::Statistics(StatisticsError::Format { line: 1, .. }))
    ));

    // The damaged record is skipped; counting resumes from commit 1.
    let mut txn = store.begin_write().expect("begin despite damaged record");
    txn.record_triples_added("p", 5).expect("record");
    txn.commit().expect("commit");

    let read = store.read().expect("read");
    let latest = read.statistics().expect("statistics").expect("record");
    assert_eq!(latest.commit_number, 3);
    assert_eq!(latest.total_triple_count, 15);
    assert_eq!(read.statistics_history().len(), 3);
}

#[test]
fn test_rewrite_store_replaces_damaged_record() {
    let cfg = config(PersistenceStrategy::Rewrite);
    let (store, disk) = memory_store(24, cfg);
    commit_counts(&store, &[4]);

    let record = store.read().expect("read").statistics().expect("statistics").expect("record");
    garble_record(&disk, store.head().root(STATISTICS_ROOT), &record);
    commit_counts(&store, &[1]);
    let latest = store.read().expect("read").statistics().expect("statistics").expect("record");
    assert_eq!(latest.commit_number, 2);
    assert_eq!(latest.total_triple_count, 1);

    // A page that fails its checksum is skipped the same way.
    disk.flip_byte(store.head().root(STATISTICS_ROOT), 100);
    commit_counts(&store, &[2]);
    let read = store.read().expect("read");
    let latest = read.statistics().expect("statistics").expect("record");
    assert_eq!(latest.commit_number, 3);
    assert_eq!(latest.total_triple_count, 2);
    assert_eq!(read.statistics_history().len(), 1);
}
