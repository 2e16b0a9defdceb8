use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

use super::{BlockAllocator, BlockHandle};

/// Buffer-pool allocator keeping every block as a separately owned heap
/// buffer. Buffers are allocated lazily so an idle pool costs nothing.
pub struct InMemoryBlockAllocator {
    block_size_bytes: usize,
    slots: Vec<RwLock<Option<Vec<u8>>>>,
    free: Mutex<Vec<usize>>,
}

impl InMemoryBlockAllocator {
    pub fn new(block_size_bytes: usize, slot_count: usize) -> Self {
        let slots = (0..slot_count).map(|_| RwLock::new(None)).collect();
        // Hand out low indices first; purely cosmetic but keeps tests and
        // debug logs readable.
        let free = (0..slot_count).rev().collect();
        Self {
            block_size_bytes,
            slots,
            free: Mutex::new(free),
        }
    }

    fn check_range(&self, offset_bytes: u64, size_bytes: usize) -> Result<()> {
        let end = offset_bytes
            .checked_add(size_bytes as u64)
            .ok_or_else(|| Error::InvalidArgument("block offset overflow".to_string()))?;
        if end > self.block_size_bytes as u64 {
            return Err(Error::InvalidArgument(format!(
                "range {}..{} exceeds block size {}",
                offset_bytes, end, self.block_size_bytes
            )));
        }
        Ok(())
    }

    fn slot(&self, handle: BlockHandle) -> Result<&RwLock<Option<Vec<u8>>>> {
        self.slots
            .get(handle.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown block handle {}", handle.0)))
    }
}

impl BlockAllocator for InMemoryBlockAllocator {
    fn allocate(&self) -> Result<BlockHandle> {
        let index = {
            let mut free = self
                .free
                .lock()
                .map_err(|_| Error::IntegrityViolation("allocator lock poisoned".to_string()))?;
            free.pop().ok_or(Error::Exhausted("block pool"))?
        };
        let mut slot = self.slots[index]
            .write()
            .map_err(|_| Error::IntegrityViolation("block lock poisoned".to_string()))?;
        *slot = Some(vec![0u8; self.block_size_bytes]);
        Ok(BlockHandle(index))
    }

    fn allocate_at(&self, _device_offset_bytes: u64) -> Option<BlockHandle> {
        // Memory has no stable addresses to reattach to.
        None
    }

    fn release(&self, handle: BlockHandle) {
        if let Some(slot) = self.slots.get(handle.0) {
            if let Ok(mut slot) = slot.write() {
                if slot.take().is_some() {
                    if let Ok(mut free) = self.free.lock() {
                        free.push(handle.0);
                    }
                }
            }
        }
    }

    fn write_at(&self, handle: BlockHandle, offset_bytes: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset_bytes, data.len())?;
        let mut slot = self
            .slot(handle)?
            .write()
            .map_err(|_| Error::IntegrityViolation("block lock poisoned".to_string()))?;
        let buffer = slot
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument(format!("block {} not allocated", handle.0)))?;
        let start = offset_bytes as usize;
        buffer[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_at(
        &self,
        handle: BlockHandle,
        offset_bytes: u64,
        size_bytes: usize,
    ) -> Result<Vec<u8>> {
        self.check_range(offset_bytes, size_bytes)?;
        let slot = self
            .slot(handle)?
            .read()
            .map_err(|_| Error::IntegrityViolation("block lock poisoned".to_string()))?;
        let buffer = slot
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument(format!("block {} not allocated", handle.0)))?;
        let start = offset_bytes as usize;
        Ok(buffer[start..start + size_bytes].to_vec())
    }

    fn device_offset(&self, _handle: BlockHandle) -> Option<u64> {
        None
    }

    fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
