//! In-memory storage backend with fault injection.
//!
//! [`MemoryStorage`] keeps pages in memory and models the gap between a
//! write and its durability: written pages stay pending until `sync`.
//! [`MemoryStorage::crash`] throws the pending writes away, which is what a
//! power loss does to a real file.
//!
//! Faults are injected at the page level, driven by a seeded RNG so a failing
//! run can be replayed:
//! - Read/write/sync errors
//! - Bit flips on read
//! - Torn (partial) writes
//!
//! Handles are cheap to clone and all clones share one simulated disk, so a
//! test can keep a handle after giving another one to a store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE, Page, PageId};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of page corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
            partial_write_rate: 0.001,
        }
    }

    /// Fail every sync and nothing else.
    #[must_use]
    pub fn failing_sync() -> Self {
        Self {
            sync_error_rate: 1.0,
            ..Self::default()
        }
    }
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorageStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

struct SimulatedDisk {
    /// Pages that survived the last sync.
    durable: HashMap<PageId, Page>,
    /// Pages written since the last sync.
    pending: HashMap<PageId, Page>,
    /// Capacity that survived the last sync.
    durable_pages: u64,
    total_pages: u64,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStorageStats,
}

impl SimulatedDisk {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a page by flipping random bits.
    fn corrupt_page(&mut self, page: &mut Page) {
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            page.as_bytes_mut()[byte_offset] ^= 1 << bit;
        }
    }

    /// Simulate a partial write by zeroing out the tail of the page.
    fn make_partial_write(&mut self, page: &mut Page) {
        let cutoff = self.rng.random_range(0..PAGE_SIZE);
        for byte in page.as_bytes_mut().iter_mut().skip(cutoff) {
            *byte = 0;
        }
    }
}

/// In-memory storage implementation for deterministic testing.
#[derive(Clone)]
pub struct MemoryStorage {
    disk: Arc<Mutex<SimulatedDisk>>,
}

impl MemoryStorage {
    /// Create a new, empty simulated disk with the given seed.
    ///
    /// The seed ensures deterministic behavior: the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated disk with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            disk: Arc::new(Mutex::new(SimulatedDisk {
                durable: HashMap::new(),
                pending: HashMap::new(),
                durable_pages: 0,
                total_pages: 0,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStorageStats::default(),
            })),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn disk(&self) -> MutexGuard<'_, SimulatedDisk> {
        self.disk.lock().expect("lock poisoned")
    }

    /// Get a snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStorageStats {
        self.disk().stats.clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.disk().fault_config = config;
    }

    /// Drop every write that has not been synced.
    pub fn crash(&self) {
        let mut disk = self.disk();
        let lost = disk.pending.len();
        disk.pending.clear();
        disk.total_pages = disk.durable_pages;
        debug!(lost_pages = lost, "simulated crash");
    }

    /// Write a page straight to the durable image, bypassing faults.
    ///
    /// Used to model damage that happened behind the store's back, such as
    /// a torn header write.
    pub fn overwrite_durable(&self, page_id: PageId, page: Page) {
        let mut disk = self.disk();
        disk.pending.remove(&page_id);
        disk.durable.insert(page_id, page);
        if page_id >= disk.durable_pages {
            disk.durable_pages = page_id + 1;
            disk.total_pages = disk.total_pages.max(page_id + 1);
        }
    }

    /// Flip one byte of a stored page.
    pub fn flip_byte(&self, page_id: PageId, offset: usize) {
        let mut disk = self.disk();
        if let Some(page) = disk.pending.get_mut(&page_id) {
            page.as_bytes_mut()[offset] ^= 0xFF;
        } else if let Some(page) = disk.durable.get_mut(&page_id) {
            page.as_bytes_mut()[offset] ^= 0xFF;
        }
    }

    /// Read the current content of a page without fault injection.
    #[must_use]
    pub fn peek(&self, page_id: PageId) -> Option<Page> {
        let disk = self.disk();
        disk.pending
            .get(&page_id)
            .or_else(|| disk.durable.get(&page_id))
            .cloned()
    }
}

impl Storage for MemoryStorage {
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        let mut disk = self.disk();
        disk.stats.reads += 1;

        if page_id >= disk.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: disk.total_pages,
            });
        }

        let rate = disk.fault_config.read_error_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let mut page = disk
            .pending
            .get(&page_id)
            .or_else(|| disk.durable.get(&page_id))
            .cloned()
            .unwrap_or_default();

        let rate = disk.fault_config.corruption_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.corrupted_reads += 1;
            disk.corrupt_page(&mut page);
        }

        Ok(page)
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        let mut disk = self.disk();
        disk.stats.writes += 1;

        if page_id >= disk.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: disk.total_pages,
            });
        }

        let rate = disk.fault_config.write_error_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut page_to_write = page.clone();

        let rate = disk.fault_config.partial_write_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.partial_writes += 1;
            disk.make_partial_write(&mut page_to_write);
        }

        disk.pending.insert(page_id, page_to_write);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut disk = self.disk();
        disk.stats.syncs += 1;

        let rate = disk.fault_config.sync_error_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        let pending = std::mem::take(&mut disk.pending);
        disk.durable.extend(pending);
        disk.durable_pages = disk.total_pages;
        Ok(())
    }

    fn ensure_capacity(&mut self, total_pages: u64) -> Result<(), StorageError> {
        let mut disk = self.disk();
        disk.total_pages = disk.total_pages.max(total_pages);
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.disk().total_pages
    }
}
