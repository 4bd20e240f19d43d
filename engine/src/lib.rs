// Life of a write:
// 1. `Store::begin_write` takes the writer lock and pins the current head
// 2. Index mutations copy the root-to-leaf path into freshly allocated pages
// 3. Commit flushes the graph index, appends a statistics record, syncs the
//    data pages, writes the header into the other slot and syncs again
// 4. Only then do new readers see the new roots
//
// Readers pin a commit and never block the writer.

pub mod config;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, PersistenceStrategy, StoreConfig};
pub use storage::{ReadTransaction, Store, StoreError, WriteTransaction};
