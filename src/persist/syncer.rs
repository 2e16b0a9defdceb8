use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::block::{BlockAllocator, PersistentBlockList};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context};
use crate::store::StoreCore;

use super::{DirectoryBackedPersistentStateStore, PersistentState};

/// Drives the epoch snapshot protocol for a persistent store.
///
/// One pass is: seal the open epoch (store lock) -> flush the data and
/// key-map devices (no lock) -> capture the inventory (store lock) -> write
/// the snapshot file (no lock) -> acknowledge (store lock), which frees
/// quarantined slots and advances the id reservation. Because the flush
/// precedes the snapshot covering it, the persisted epoch never runs ahead
/// of durable data; a crash loses at most the writes since the last pass.
///
/// The two background loops both funnel into `persist_pass`; an internal
/// mutex serializes them so captures and acknowledgements never interleave.
pub struct PeriodicSyncer {
    core: Arc<RwLock<StoreCore>>,
    state_store: DirectoryBackedPersistentStateStore,
    allocator: Arc<dyn BlockAllocator>,
    key_map_device: Option<Arc<dyn BlockDevice>>,
    hash_seed: u64,
    pass: Mutex<()>,
}

impl PeriodicSyncer {
    pub(crate) fn new(
        core: Arc<RwLock<StoreCore>>,
        state_store: DirectoryBackedPersistentStateStore,
        allocator: Arc<dyn BlockAllocator>,
        key_map_device: Option<Arc<dyn BlockDevice>>,
        hash_seed: u64,
    ) -> Self {
        Self {
            core,
            state_store,
            allocator,
            key_map_device,
            hash_seed,
            pass: Mutex::new(()),
        }
    }

    fn with_list<T>(&self, f: impl FnOnce(&mut PersistentBlockList) -> T) -> Result<T> {
        let mut core = self
            .core
            .write()
            .map_err(|_| Error::IntegrityViolation("store lock poisoned".to_string()))?;
        let list = core
            .blob_map
            .list_mut()
            .as_persistent()
            .ok_or_else(|| {
                Error::IntegrityViolation(
                    "periodic syncer attached to a volatile block list".to_string(),
                )
            })?;
        Ok(f(list))
    }

    /// Runs one snapshot pass. Skips when nothing is pending unless
    /// `force` is set. Returns whether a snapshot was written.
    pub fn persist_pass(&self, force: bool) -> Result<bool> {
        let _pass = self
            .pass
            .lock()
            .map_err(|_| Error::IntegrityViolation("syncer pass lock poisoned".to_string()))?;

        let sealed = self.with_list(|list| {
            if !force && list.pending_put_count() == 0 && list.pending_release_count() == 0 {
                return None;
            }
            Some(list.seal_epoch())
        })?;
        if sealed.is_none() {
            return Ok(false);
        }

        // Durability of data precedes the snapshot that covers it.
        self.allocator.sync()?;
        if let Some(device) = &self.key_map_device {
            device.sync()?;
        }

        let (oldest_epoch_id, next_block_id, blocks) = self.with_list(|list| list.capture())?;
        let state = PersistentState {
            hash_seed: self.hash_seed,
            oldest_epoch_id,
            next_block_id,
            blocks,
        };
        self.state_store.write(&state)?;
        tracing::debug!(
            oldest_epoch_id,
            block_count = state.blocks.len(),
            "Persisted state snapshot"
        );

        self.with_list(|list| list.state_written())?;
        Ok(true)
    }
}

/// Loop covering committed writes: runs every minimum epoch interval, or
/// earlier when the pending write count reaches its batch cap.
pub struct BlockPutSyncTask {
    syncer: Arc<PeriodicSyncer>,
    interval: Duration,
    wakeup: Arc<Notify>,
}

impl BlockPutSyncTask {
    pub fn new(syncer: Arc<PeriodicSyncer>, interval: Duration, wakeup: Arc<Notify>) -> Self {
        Self {
            syncer,
            interval,
            wakeup,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for BlockPutSyncTask {
    fn name(&self) -> &'static str {
        "block-put-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn wakeup(&self) -> Option<Arc<Notify>> {
        Some(self.wakeup.clone())
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.syncer.persist_pass(false)?;
        Ok(())
    }
}

/// Loop returning released blocks to service: woken on every block
/// release, with the interval tick as a fallback. A released slot is only
/// reusable once a snapshot that no longer references it is durable, so
/// turnaround here bounds how long rotation can starve the allocator.
pub struct BlockReleaseSyncTask {
    syncer: Arc<PeriodicSyncer>,
    interval: Duration,
    wakeup: Arc<Notify>,
}

impl BlockReleaseSyncTask {
    pub fn new(syncer: Arc<PeriodicSyncer>, interval: Duration, wakeup: Arc<Notify>) -> Self {
        Self {
            syncer,
            interval,
            wakeup,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for BlockReleaseSyncTask {
    fn name(&self) -> &'static str {
        "block-release-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn wakeup(&self) -> Option<Arc<Notify>> {
        Some(self.wakeup.clone())
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.syncer.persist_pass(false)?;
        Ok(())
    }
}
