use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::config::StoreConfig;
use crate::storage::{MemoryStorage, Store, StoreError};

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a store on a fresh simulated disk.
///
/// The returned [`MemoryStorage`] shares the disk with the store, so tests
/// can crash it, damage pages or reopen it.
pub fn new_memory_store(seed: u64, config: StoreConfig) -> Result<(Store, MemoryStorage), StoreError> {
    init_tracing();
    let disk = MemoryStorage::new(seed);
    let store = Store::create_with_storage(Box::new(disk.clone()), config)?;
    Ok((store, disk))
}

/// Create a store file in a temporary directory.
///
/// The directory and the file are removed when the [`TempDir`] is dropped.
pub fn new_file_store(config: StoreConfig) -> Result<(TempDir, Store), StoreError> {
    init_tracing();
    #[allow(clippy::expect_used)]
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Store::create(&dir.path().join("store.db"), config)?;
    Ok((dir, store))
}
