mod device_backed;
mod in_memory;
mod list;
mod persistent_list;

pub use device_backed::DeviceBackedBlockAllocator;
pub use in_memory::InMemoryBlockAllocator;
pub use list::{AnyBlockList, BlockList, VolatileBlockList};
pub use persistent_list::{BlockDescriptor, PersistentBlockList, RestoredBlock, SyncEvents};

use crate::error::Result;

/// Opaque handle to an allocated block slot. Valid until the slot is
/// released back to its allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub(crate) usize);

/// A fixed pool of fixed-capacity storage blocks. Each block is a linear
/// byte range readable and writable at arbitrary offsets; release always
/// returns the whole unit.
pub trait BlockAllocator: Send + Sync {
    /// Takes a free slot from the pool. `Error::Exhausted` when none is
    /// left.
    fn allocate(&self) -> Result<BlockHandle>;

    /// Reattaches the block at a previously persisted device offset.
    /// Returns `None` when the offset is out of range, not block-aligned,
    /// or the slot is already taken; callers treat such blocks as already
    /// released. Always `None` for allocators without stable addresses.
    fn allocate_at(&self, device_offset_bytes: u64) -> Option<BlockHandle>;

    /// Returns the whole slot to the free pool. The handle must not be
    /// used afterwards.
    fn release(&self, handle: BlockHandle);

    fn write_at(&self, handle: BlockHandle, offset_bytes: u64, data: &[u8]) -> Result<()>;
    fn read_at(&self, handle: BlockHandle, offset_bytes: u64, size_bytes: usize)
        -> Result<Vec<u8>>;

    /// Stable device address of the block, for the snapshot inventory.
    /// `None` for in-memory blocks.
    fn device_offset(&self, handle: BlockHandle) -> Option<u64>;

    fn block_size_bytes(&self) -> u64;

    /// Forces durability of all block writes issued so far.
    fn sync(&self) -> Result<()>;
}
