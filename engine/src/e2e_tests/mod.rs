//! End-to-end tests at the store level.
//!
//! Each test file covers a specific scenario through the public `Store`
//! API, using seeded simulated disks or temporary files.

#![cfg(test)]

mod helpers;

mod test_concurrent_readers;
mod test_corruption;
mod test_crash_recovery;
mod test_duplicate_key;
mod test_fault_injection;
mod test_file_store;
mod test_graph_index;
mod test_history;
mod test_ordering;
mod test_preload;
mod test_rewrite_strategy;
mod test_snapshot_isolation;
mod test_statistics;
