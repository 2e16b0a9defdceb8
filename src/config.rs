use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Backing storage for blob blocks.
#[derive(Debug, Clone)]
pub enum BlocksBackend {
    /// Separately allocated heap buffers, one per block.
    InMemory { block_size_bytes: usize },
    /// A memory-mapped file or block device, partitioned into
    /// sector-aligned block slots at open time.
    Device { path: PathBuf, size_bytes: u64 },
}

/// Backing storage for the key-location map's record array.
#[derive(Debug, Clone)]
pub enum KeyMapBackend {
    InMemory { entries: usize },
    /// Entry count is derived from the region size divided by the
    /// fixed record size.
    Device { path: PathBuf, size_bytes: u64 },
}

/// When a read hit should be re-written into the `new` generation so that
/// frequently accessed content resists eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    Never,
    /// Promote reads from the oldest generation only (default). Minimizes
    /// redundant copies while keeping hot data out of the eviction path.
    OldOnly,
    OldAndCurrent,
}

/// Durability settings. Absent means the store is volatile: contents are
/// lost on restart and the hash seed is randomized per instance.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Directory holding the state snapshot and the instance lock file.
    pub state_directory: PathBuf,

    /// Minimum time between epoch snapshots taken by the put loop
    /// (default: 10s). Every committed write is covered by a snapshot
    /// within roughly this interval.
    pub minimum_epoch_interval: Duration,

    /// Pending-write count that wakes the put loop early (default: 1024).
    pub maximum_put_batch: usize,
}

impl PersistenceConfig {
    pub fn new(state_directory: impl Into<PathBuf>) -> Self {
        Self {
            state_directory: state_directory.into(),
            minimum_epoch_interval: Duration::from_secs(10),
            maximum_put_batch: 1024,
        }
    }

    pub fn minimum_epoch_interval(mut self, interval: Duration) -> Self {
        self.minimum_epoch_interval = interval;
        self
    }

    pub fn maximum_put_batch(mut self, count: usize) -> Self {
        self.maximum_put_batch = count;
        self
    }
}

/// Configuration for a blob store instance. Collaborators hand the store
/// fully resolved parameters; validation here is range checking only.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub blocks: BlocksBackend,
    pub key_map: KeyMapBackend,

    /// Block counts per generation. The device is partitioned into
    /// `spare + old + current + new` slots.
    pub old_blocks: usize,
    pub current_blocks: usize,
    pub new_blocks: usize,
    /// Extra slots so rotation and release quarantine never starve the
    /// allocator (default: 1).
    pub spare_blocks: usize,

    /// Probe budgets for the key-location map (defaults: 8 / 32).
    pub max_get_attempts: usize,
    pub max_put_attempts: usize,

    pub refresh_policy: RefreshPolicy,

    pub persistence: Option<PersistenceConfig>,
}

impl StoreConfig {
    pub fn new(blocks: BlocksBackend, key_map: KeyMapBackend) -> Self {
        Self {
            blocks,
            key_map,
            old_blocks: 2,
            current_blocks: 2,
            new_blocks: 2,
            spare_blocks: 1,
            max_get_attempts: 8,
            max_put_attempts: 32,
            refresh_policy: RefreshPolicy::OldOnly,
            persistence: None,
        }
    }

    pub fn old_blocks(mut self, count: usize) -> Self {
        self.old_blocks = count;
        self
    }

    pub fn current_blocks(mut self, count: usize) -> Self {
        self.current_blocks = count;
        self
    }

    pub fn new_blocks(mut self, count: usize) -> Self {
        self.new_blocks = count;
        self
    }

    pub fn spare_blocks(mut self, count: usize) -> Self {
        self.spare_blocks = count;
        self
    }

    pub fn max_get_attempts(mut self, attempts: usize) -> Self {
        self.max_get_attempts = attempts;
        self
    }

    pub fn max_put_attempts(mut self, attempts: usize) -> Self {
        self.max_put_attempts = attempts;
        self
    }

    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Total block slots the allocator must provide.
    pub fn total_blocks(&self) -> usize {
        self.spare_blocks + self.old_blocks + self.current_blocks + self.new_blocks
    }

    /// Range validation, performed once before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.old_blocks == 0 || self.current_blocks == 0 || self.new_blocks == 0 {
            return Err(Error::InvalidArgument(
                "old, current and new block counts must be non-zero".to_string(),
            ));
        }
        if self.max_get_attempts == 0 || self.max_put_attempts == 0 {
            return Err(Error::InvalidArgument(
                "probe attempt limits must be non-zero".to_string(),
            ));
        }
        match &self.blocks {
            BlocksBackend::InMemory { block_size_bytes } if *block_size_bytes == 0 => {
                return Err(Error::InvalidArgument(
                    "block size must be non-zero".to_string(),
                ));
            }
            BlocksBackend::Device { size_bytes, .. } if *size_bytes == 0 => {
                return Err(Error::InvalidArgument(
                    "blocks device size must be non-zero".to_string(),
                ));
            }
            _ => {}
        }
        match &self.key_map {
            KeyMapBackend::InMemory { entries } if *entries == 0 => {
                return Err(Error::InvalidArgument(
                    "key-location map must have at least one entry".to_string(),
                ));
            }
            KeyMapBackend::Device { size_bytes, .. } if *size_bytes == 0 => {
                return Err(Error::InvalidArgument(
                    "key-location map device size must be non-zero".to_string(),
                ));
            }
            _ => {}
        }
        if let Some(persistence) = &self.persistence {
            if persistence.maximum_put_batch == 0 {
                return Err(Error::InvalidArgument(
                    "maximum put batch must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}
