use std::sync::{Arc, RwLock};

use crate::blobmap::{LiveBlockRegistry, OldCurrentNewLocationBlobMap};
use crate::block::{
    AnyBlockList, BlockAllocator, DeviceBackedBlockAllocator, InMemoryBlockAllocator,
    PersistentBlockList, VolatileBlockList,
};
use crate::config::{BlocksBackend, KeyMapBackend, StoreConfig};
use crate::device::{BlockDevice, MemoryMappedBlockDevice};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::flock::StateDirectoryLock;
use crate::keymap::{
    DeviceBackedLocationRecordArray, HashingKeyLocationMap, InMemoryLocationRecordArray,
    LocationRecordArray,
};
use crate::persist::{
    BlockPutSyncTask, BlockReleaseSyncTask, DirectoryBackedPersistentStateStore, PeriodicSyncer,
};
use crate::scheduler::Scheduler;

const LOCK_FILE: &str = "LOCK";

/// The mutable heart of the store: the key-location map and the
/// location-blob map, mutated together under one lock so no caller ever
/// observes an index entry without its data or vice versa.
pub(crate) struct StoreCore {
    pub(crate) key_map: HashingKeyLocationMap,
    pub(crate) blob_map: OldCurrentNewLocationBlobMap,
}

/// Content-addressable blob store over a fixed pool of append-only blocks.
///
/// All mutations to the block list, location-blob map and key-location map
/// are serialized through a single process-wide read-write lock. Reads
/// (`get`, `find_missing`) take it shared; writes (`put`, generation
/// rotation, snapshot capture, reattachment) take it exclusive. The
/// dominant cost is device I/O, not this lock.
///
/// Persistent stores run two background loops on the tokio runtime and
/// should be shut down with [`BlobStore::close`]; dropping the store
/// instead aborts the loops without a final snapshot, losing at most the
/// writes since the last completed pass.
pub struct BlobStore {
    core: Arc<RwLock<StoreCore>>,
    syncer: Option<Arc<PeriodicSyncer>>,
    scheduler: Option<Scheduler>,
    _state_lock: Option<StateDirectoryLock>,
}

fn poisoned(_: impl std::fmt::Debug) -> Error {
    Error::IntegrityViolation("store lock poisoned".to_string())
}

impl BlobStore {
    /// Assembles a store from fully resolved parameters. With persistence
    /// enabled, a previous lifetime's state is reattached; a snapshot that
    /// cannot be reattached consistently makes the open fail rather than
    /// silently dropping data.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let total_blocks = config.total_blocks();
        let allocator: Arc<dyn BlockAllocator> = match &config.blocks {
            BlocksBackend::InMemory { block_size_bytes } => Arc::new(InMemoryBlockAllocator::new(
                *block_size_bytes,
                total_blocks,
            )),
            BlocksBackend::Device { path, size_bytes } => {
                let device: Arc<dyn BlockDevice> =
                    Arc::new(MemoryMappedBlockDevice::open(path, *size_bytes)?);
                Arc::new(DeviceBackedBlockAllocator::new(device, total_blocks)?)
            }
        };

        let (record_array, key_map_device): (
            Box<dyn LocationRecordArray>,
            Option<Arc<dyn BlockDevice>>,
        ) = match &config.key_map {
            KeyMapBackend::InMemory { entries } => {
                (Box::new(InMemoryLocationRecordArray::new(*entries)), None)
            }
            KeyMapBackend::Device { path, size_bytes } => {
                let device: Arc<dyn BlockDevice> =
                    Arc::new(MemoryMappedBlockDevice::open(path, *size_bytes)?);
                (
                    Box::new(DeviceBackedLocationRecordArray::new(device.clone())?),
                    Some(device),
                )
            }
        };

        let mut state_lock = None;
        let mut persistent_setup = None;
        let (seed, list, restored) = match &config.persistence {
            None => (
                rand::random(),
                AnyBlockList::Volatile(VolatileBlockList::new(allocator.clone())),
                Vec::new(),
            ),
            Some(persistence) => {
                if matches!(config.blocks, BlocksBackend::InMemory { .. }) {
                    return Err(Error::InvalidArgument(
                        "persistence requires device-backed blocks".to_string(),
                    ));
                }
                let state_store =
                    DirectoryBackedPersistentStateStore::new(&persistence.state_directory)?;
                state_lock = Some(StateDirectoryLock::acquire(
                    persistence.state_directory.join(LOCK_FILE),
                )?);

                let (seed, list, restored) = match state_store.read()? {
                    Some(state) => {
                        let (list, restored) = PersistentBlockList::restore(
                            allocator.clone(),
                            state.oldest_epoch_id,
                            state.next_block_id,
                            &state.blocks,
                            persistence.maximum_put_batch,
                        )?;
                        tracing::info!(
                            restored = restored.len(),
                            inventory = state.blocks.len(),
                            "Reattached previous block inventory"
                        );
                        (state.hash_seed, list, restored)
                    }
                    None => (
                        rand::random(),
                        PersistentBlockList::new(allocator.clone(), persistence.maximum_put_batch),
                        Vec::new(),
                    ),
                };
                let events = list.sync_events();
                persistent_setup = Some((state_store, events, persistence.minimum_epoch_interval));
                (seed, AnyBlockList::Persistent(list), restored)
            }
        };

        let registry = LiveBlockRegistry::new();
        let blob_map = OldCurrentNewLocationBlobMap::new(
            list,
            registry.clone(),
            config.refresh_policy,
            config.new_blocks,
            &restored,
        );
        let key_map = HashingKeyLocationMap::new(
            record_array,
            registry,
            seed,
            config.max_get_attempts,
            config.max_put_attempts,
        );
        let core = Arc::new(RwLock::new(StoreCore { key_map, blob_map }));

        let (syncer, scheduler) = match persistent_setup {
            None => (None, None),
            Some((state_store, events, interval)) => {
                let syncer = Arc::new(PeriodicSyncer::new(
                    core.clone(),
                    state_store,
                    allocator.clone(),
                    key_map_device.clone(),
                    seed,
                ));
                // Initial snapshot: prunes blocks that failed reattachment
                // and reserves this lifetime's block id range.
                syncer.persist_pass(true)?;

                let scheduler = Scheduler::new();
                scheduler.register(Arc::new(BlockPutSyncTask::new(
                    syncer.clone(),
                    interval,
                    events.put_wakeup.clone(),
                )));
                scheduler.register(Arc::new(BlockReleaseSyncTask::new(
                    syncer.clone(),
                    interval,
                    events.release_wakeup.clone(),
                )));
                (Some(syncer), Some(scheduler))
            }
        };

        Ok(Self {
            core,
            syncer,
            scheduler,
            _state_lock: state_lock,
        })
    }

    /// Retrieves a blob by digest. The stored byte count is validated
    /// against the digest's declared size; a mismatch surfaces as
    /// `Corrupt` and is never repaired in place. A hit in a generation
    /// covered by the refresh policy is re-written into `new` so it
    /// resists eviction.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let (data, needs_refresh) = {
            let core = self.core.read().map_err(poisoned)?;
            let location = core.key_map.get(digest)?;
            let data = core.blob_map.get(&location)?;
            let needs_refresh = core
                .blob_map
                .generation_of(&location)
                .map(|generation| core.blob_map.should_refresh(generation))
                .unwrap_or(false);
            (data, needs_refresh)
        };

        if data.len() as u64 != digest.size_bytes() {
            return Err(Error::Corrupt(format!(
                "digest {} declares {} bytes, stored blob has {}",
                digest,
                digest.size_bytes(),
                data.len()
            )));
        }

        if needs_refresh {
            // Best effort: the caller asked for bytes, not for a
            // promotion. find_missing is the path that must guarantee it.
            if let Err(err) = self.refresh_blob(digest) {
                tracing::warn!(digest = %digest, error = %err, "Failed to refresh blob on read");
            }
        }
        Ok(data)
    }

    /// Stores a blob under its digest. Space reservation, the data write
    /// and the index insertion happen atomically with respect to other
    /// callers; a failed put leaves no index entry behind.
    pub fn put(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        if data.len() as u64 != digest.size_bytes() {
            return Err(Error::InvalidArgument(format!(
                "digest {} declares {} bytes, caller supplied {}",
                digest,
                digest.size_bytes(),
                data.len()
            )));
        }
        let mut core = self.core.write().map_err(poisoned)?;
        let location = core.blob_map.put(data)?;
        core.key_map.put(digest, location)
    }

    /// Returns the digests that are not present in the store. Present
    /// blobs in a generation covered by the refresh policy are promoted,
    /// so a caller that skips an upload based on this answer can rely on
    /// the blob staying retrievable; a failed promotion therefore fails
    /// the call instead of over-promising.
    pub fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        let mut refresh = Vec::new();
        {
            let core = self.core.read().map_err(poisoned)?;
            for digest in digests {
                match core.key_map.get(digest) {
                    Ok(location) => match core.blob_map.generation_of(&location) {
                        Some(generation) if core.blob_map.should_refresh(generation) => {
                            refresh.push(*digest);
                        }
                        Some(_) => {}
                        None => missing.push(*digest),
                    },
                    Err(Error::NotFound) => missing.push(*digest),
                    Err(err) => return Err(err),
                }
            }
        }
        for digest in &refresh {
            self.refresh_blob(digest)?;
        }
        Ok(missing)
    }

    /// Re-resolves the digest under the exclusive lock and copies the blob
    /// into the `new` generation. The world may have moved since the
    /// caller's shared-lock read: the entry can be gone, already promoted,
    /// or rotated out, all of which end the refresh quietly.
    fn refresh_blob(&self, digest: &Digest) -> Result<()> {
        let mut core = self.core.write().map_err(poisoned)?;
        let location = match core.key_map.get(digest) {
            Ok(location) => location,
            Err(Error::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let generation = match core.blob_map.generation_of(&location) {
            Some(generation) => generation,
            None => return Ok(()),
        };
        if !core.blob_map.should_refresh(generation) {
            return Ok(());
        }
        let data = core.blob_map.get(&location)?;
        let new_location = core.blob_map.put(&data)?;
        core.key_map.put(digest, new_location)?;
        tracing::debug!(digest = %digest, "Refreshed blob into new generation");
        Ok(())
    }

    /// Forces an immediate epoch seal, device flush and snapshot. No-op
    /// for volatile stores.
    pub fn flush(&self) -> Result<()> {
        match &self.syncer {
            Some(syncer) => syncer.persist_pass(true).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: joins both background loops, then persists a
    /// final snapshot covering every committed write.
    pub async fn close(mut self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await?;
        }
        if let Some(syncer) = self.syncer.take() {
            syncer.persist_pass(true)?;
        }
        Ok(())
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
    }
}
