use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

use super::{BlockAllocator, BlockHandle, BlockList};

/// Span of fresh block ids reserved ahead of each persisted snapshot. Ids
/// handed out beyond the durable reservation could collide with ids used by
/// a crashed lifetime whose location records survive on a device-backed
/// key-location map, so allocation refuses to cross the reserved limit.
const ID_RESERVATION_LEAP: u64 = 1 << 32;

/// Snapshot inventory entry for one live block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub block_id: u64,
    pub device_offset_bytes: u64,
    /// Epoch of the block's most recent sealed write.
    pub write_epoch_id: u64,
    /// Append position at the time that epoch was sealed. Bytes beyond it
    /// were not covered by the snapshot and are discarded on reattach.
    pub sealed_fill_bytes: u64,
}

/// Wakeup handles shared between the block list and the periodic syncer's
/// two loops.
#[derive(Clone)]
pub struct SyncEvents {
    pub put_wakeup: Arc<Notify>,
    pub release_wakeup: Arc<Notify>,
}

struct SealInfo {
    epoch_id: u64,
    fill_bytes: u64,
}

struct PersistentBlockState {
    id: u64,
    handle: BlockHandle,
    write_offset: u64,
    /// Written since the last epoch seal.
    dirty: bool,
    sealed: Option<SealInfo>,
}

/// A block restored from a previous process lifetime: its id and the byte
/// limit up to which its contents are known durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredBlock {
    pub block_id: u64,
    pub validated_fill_bytes: u64,
}

/// Block list that survives restarts. Tracks, per block, the epoch of its
/// last sealed write; quarantines released blocks until a snapshot that no
/// longer references them is durable; and reattaches a previous inventory
/// on startup.
///
/// The epoch handshake driven by the periodic syncer is:
/// `seal_epoch` (store lock) -> device flush (no lock) -> `capture` (store
/// lock) -> snapshot file write (no lock) -> `state_written` (store lock).
pub struct PersistentBlockList {
    allocator: Arc<dyn BlockAllocator>,
    blocks: VecDeque<PersistentBlockState>,
    next_block_id: u64,
    /// Allocation may not cross this limit until a snapshot reserving a
    /// higher one has been written.
    id_reservation_limit: u64,
    pending_reservation: Option<u64>,
    /// Epoch that new writes are stamped with once sealed.
    open_epoch_id: u64,
    pending_put_count: usize,
    maximum_put_batch: usize,
    /// Released blocks whose slots must not be reused yet.
    quarantine: Vec<BlockHandle>,
    /// Quarantined blocks already excluded from a captured snapshot,
    /// releasable once that snapshot is durable.
    releasable: Vec<BlockHandle>,
    events: SyncEvents,
}

impl PersistentBlockList {
    /// Fresh list with nothing to reattach. No block can be allocated
    /// until an initial snapshot establishes an id reservation; the store
    /// runs one sync pass at open for exactly that reason.
    pub fn new(allocator: Arc<dyn BlockAllocator>, maximum_put_batch: usize) -> Self {
        Self {
            allocator,
            blocks: VecDeque::new(),
            next_block_id: 0,
            id_reservation_limit: 0,
            pending_reservation: None,
            open_epoch_id: 0,
            pending_put_count: 0,
            maximum_put_batch,
            quarantine: Vec::new(),
            releasable: Vec::new(),
            events: SyncEvents {
                put_wakeup: Arc::new(Notify::new()),
                release_wakeup: Arc::new(Notify::new()),
            },
        }
    }

    /// Reattaches a previous inventory. Each descriptor is re-validated
    /// against the device; blocks that fail validation are treated as
    /// already released. Structural inconsistencies in the inventory
    /// itself are fatal. Returns the list plus the blocks that survived,
    /// in inventory order.
    pub fn restore(
        allocator: Arc<dyn BlockAllocator>,
        oldest_epoch_id: u64,
        next_block_id: u64,
        descriptors: &[BlockDescriptor],
        maximum_put_batch: usize,
    ) -> Result<(Self, Vec<RestoredBlock>)> {
        let mut list = Self::new(allocator, maximum_put_batch);
        list.next_block_id = next_block_id;
        list.open_epoch_id = oldest_epoch_id;

        let mut restored = Vec::new();
        let mut previous_id = None;
        for descriptor in descriptors {
            if let Some(previous) = previous_id {
                if descriptor.block_id <= previous {
                    return Err(Error::IntegrityViolation(format!(
                        "block inventory ids not increasing: {} after {}",
                        descriptor.block_id, previous
                    )));
                }
            }
            previous_id = Some(descriptor.block_id);

            if descriptor.block_id >= next_block_id {
                return Err(Error::IntegrityViolation(format!(
                    "block id {} exceeds persisted id reservation {}",
                    descriptor.block_id, next_block_id
                )));
            }
            if descriptor.sealed_fill_bytes > list.allocator.block_size_bytes() {
                return Err(Error::IntegrityViolation(format!(
                    "block {} fill {} exceeds block size {}",
                    descriptor.block_id,
                    descriptor.sealed_fill_bytes,
                    list.allocator.block_size_bytes()
                )));
            }

            if descriptor.write_epoch_id < oldest_epoch_id {
                tracing::debug!(
                    block_id = descriptor.block_id,
                    epoch = descriptor.write_epoch_id,
                    "Skipping block from reclaimed epoch"
                );
                continue;
            }
            let handle = match list.allocator.allocate_at(descriptor.device_offset_bytes) {
                Some(handle) => handle,
                None => {
                    tracing::warn!(
                        block_id = descriptor.block_id,
                        device_offset = descriptor.device_offset_bytes,
                        "Block failed device validation, treating as released"
                    );
                    continue;
                }
            };
            list.open_epoch_id = list.open_epoch_id.max(descriptor.write_epoch_id + 1);
            list.blocks.push_back(PersistentBlockState {
                id: descriptor.block_id,
                handle,
                write_offset: descriptor.sealed_fill_bytes,
                dirty: false,
                sealed: Some(SealInfo {
                    epoch_id: descriptor.write_epoch_id,
                    fill_bytes: descriptor.sealed_fill_bytes,
                }),
            });
            restored.push(RestoredBlock {
                block_id: descriptor.block_id,
                validated_fill_bytes: descriptor.sealed_fill_bytes,
            });
        }

        Ok((list, restored))
    }

    pub fn sync_events(&self) -> SyncEvents {
        self.events.clone()
    }

    pub fn pending_put_count(&self) -> usize {
        self.pending_put_count
    }

    /// Released slots not yet covered by a durable snapshot, including
    /// ones whose snapshot write failed and must be retried.
    pub fn pending_release_count(&self) -> usize {
        self.quarantine.len() + self.releasable.len()
    }

    /// Stamps every block written during the open epoch and advances the
    /// epoch counter. Returns whether anything was sealed.
    pub fn seal_epoch(&mut self) -> bool {
        let mut sealed_any = false;
        for block in self.blocks.iter_mut() {
            if block.dirty {
                block.sealed = Some(SealInfo {
                    epoch_id: self.open_epoch_id,
                    fill_bytes: block.write_offset,
                });
                block.dirty = false;
                sealed_any = true;
            }
        }
        if sealed_any {
            self.open_epoch_id += 1;
        }
        self.pending_put_count = 0;
        sealed_any
    }

    /// Snapshots the inventory of sealed blocks. Also moves the current
    /// quarantine into the releasable set (the returned inventory no
    /// longer references those blocks) and reserves the id range the
    /// snapshot will make durable. Must be followed by `state_written`
    /// once the snapshot is on disk; the syncer serializes passes so no
    /// two captures overlap.
    pub fn capture(&mut self) -> (u64, u64, Vec<BlockDescriptor>) {
        self.releasable.append(&mut self.quarantine);

        let reserved_next = self.next_block_id + ID_RESERVATION_LEAP;
        self.pending_reservation = Some(reserved_next);

        let mut descriptors = Vec::new();
        let mut oldest_epoch_id = self.open_epoch_id;
        for block in &self.blocks {
            let sealed = match &block.sealed {
                Some(sealed) => sealed,
                // Never sealed: nothing about this block is known durable.
                None => continue,
            };
            let device_offset_bytes = match self.allocator.device_offset(block.handle) {
                Some(offset) => offset,
                None => {
                    tracing::warn!(
                        block_id = block.id,
                        "Block has no stable device address, excluding from snapshot"
                    );
                    continue;
                }
            };
            oldest_epoch_id = oldest_epoch_id.min(sealed.epoch_id);
            descriptors.push(BlockDescriptor {
                block_id: block.id,
                device_offset_bytes,
                write_epoch_id: sealed.epoch_id,
                sealed_fill_bytes: sealed.fill_bytes,
            });
        }
        (oldest_epoch_id, reserved_next, descriptors)
    }

    /// Acknowledges that the snapshot from the preceding `capture` is
    /// durable: releasable slots return to the allocator and the id
    /// reservation advances.
    pub fn state_written(&mut self) {
        for handle in self.releasable.drain(..) {
            self.allocator.release(handle);
        }
        if let Some(reservation) = self.pending_reservation.take() {
            self.id_reservation_limit = reservation;
        }
    }
}

impl BlockList for PersistentBlockList {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_id(&self, index: usize) -> u64 {
        self.blocks[index].id
    }

    fn index_of(&self, block_id: u64) -> Option<usize> {
        self.blocks
            .binary_search_by_key(&block_id, |block| block.id)
            .ok()
    }

    fn push_back(&mut self) -> Result<u64> {
        if self.next_block_id >= self.id_reservation_limit {
            // Allocating past the durable reservation could reuse an id a
            // crashed lifetime already handed out.
            return Err(Error::Exhausted("block id reservation"));
        }
        let handle = self.allocator.allocate()?;
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.push_back(PersistentBlockState {
            id,
            handle,
            write_offset: 0,
            dirty: false,
            sealed: None,
        });
        Ok(id)
    }

    fn pop_front(&mut self) -> Option<u64> {
        let block = self.blocks.pop_front()?;
        self.quarantine.push(block.handle);
        self.events.release_wakeup.notify_one();
        Some(block.id)
    }

    fn has_space(&self, index: usize, size_bytes: u64) -> bool {
        let block = &self.blocks[index];
        block.write_offset + size_bytes <= self.allocator.block_size_bytes()
    }

    fn reserve(&mut self, index: usize, size_bytes: u64) -> Result<u64> {
        if !self.has_space(index, size_bytes) {
            return Err(Error::InvalidArgument(format!(
                "reservation of {} bytes exceeds block capacity",
                size_bytes
            )));
        }
        let block = &mut self.blocks[index];
        let offset = block.write_offset;
        block.write_offset += size_bytes;
        Ok(offset)
    }

    fn write(&mut self, index: usize, offset_bytes: u64, data: &[u8]) -> Result<()> {
        let handle = {
            let block = &mut self.blocks[index];
            block.dirty = true;
            block.handle
        };
        self.allocator.write_at(handle, offset_bytes, data)?;
        self.pending_put_count += 1;
        if self.pending_put_count >= self.maximum_put_batch {
            self.events.put_wakeup.notify_one();
        }
        Ok(())
    }

    fn read(&self, index: usize, offset_bytes: u64, size_bytes: usize) -> Result<Vec<u8>> {
        let handle = self.blocks[index].handle;
        self.allocator.read_at(handle, offset_bytes, size_bytes)
    }

    fn block_size_bytes(&self) -> u64 {
        self.allocator.block_size_bytes()
    }
}
