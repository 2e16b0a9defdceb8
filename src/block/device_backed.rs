use std::sync::{Arc, Mutex};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

use super::{BlockAllocator, BlockHandle};

/// Allocator over a memory-mapped block device. The device's sector range
/// is partitioned at startup into `slot_count` equally sized, sector-aligned
/// block slots; remainder sectors stay unused.
pub struct DeviceBackedBlockAllocator {
    device: Arc<dyn BlockDevice>,
    block_size_bytes: u64,
    slot_count: usize,
    in_use: Mutex<Vec<bool>>,
}

impl DeviceBackedBlockAllocator {
    pub fn new(device: Arc<dyn BlockDevice>, slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(Error::InvalidArgument(
                "allocator needs at least one block slot".to_string(),
            ));
        }
        let block_sector_count = device.sector_count() / slot_count as u64;
        if block_sector_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "device with {} sectors cannot hold {} blocks",
                device.sector_count(),
                slot_count
            )));
        }
        let block_size_bytes = block_sector_count * device.sector_size_bytes() as u64;
        Ok(Self {
            device,
            block_size_bytes,
            slot_count,
            in_use: Mutex::new(vec![false; slot_count]),
        })
    }

    fn slot_offset(&self, index: usize) -> u64 {
        index as u64 * self.block_size_bytes
    }

    fn check_handle(&self, handle: BlockHandle) -> Result<()> {
        let in_use = self
            .in_use
            .lock()
            .map_err(|_| Error::IntegrityViolation("allocator lock poisoned".to_string()))?;
        match in_use.get(handle.0) {
            Some(true) => Ok(()),
            Some(false) => Err(Error::InvalidArgument(format!(
                "block {} not allocated",
                handle.0
            ))),
            None => Err(Error::InvalidArgument(format!(
                "unknown block handle {}",
                handle.0
            ))),
        }
    }

    fn check_range(&self, offset_bytes: u64, size_bytes: usize) -> Result<()> {
        let end = offset_bytes
            .checked_add(size_bytes as u64)
            .ok_or_else(|| Error::InvalidArgument("block offset overflow".to_string()))?;
        if end > self.block_size_bytes {
            return Err(Error::InvalidArgument(format!(
                "range {}..{} exceeds block size {}",
                offset_bytes, end, self.block_size_bytes
            )));
        }
        Ok(())
    }
}

impl BlockAllocator for DeviceBackedBlockAllocator {
    fn allocate(&self) -> Result<BlockHandle> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| Error::IntegrityViolation("allocator lock poisoned".to_string()))?;
        match in_use.iter().position(|taken| !taken) {
            Some(index) => {
                in_use[index] = true;
                Ok(BlockHandle(index))
            }
            None => Err(Error::Exhausted("block pool")),
        }
    }

    fn allocate_at(&self, device_offset_bytes: u64) -> Option<BlockHandle> {
        if device_offset_bytes % self.block_size_bytes != 0 {
            return None;
        }
        let index = (device_offset_bytes / self.block_size_bytes) as usize;
        if index >= self.slot_count {
            return None;
        }
        let mut in_use = self.in_use.lock().ok()?;
        if in_use[index] {
            return None;
        }
        in_use[index] = true;
        Some(BlockHandle(index))
    }

    fn release(&self, handle: BlockHandle) {
        if let Ok(mut in_use) = self.in_use.lock() {
            if let Some(taken) = in_use.get_mut(handle.0) {
                *taken = false;
            }
        }
    }

    fn write_at(&self, handle: BlockHandle, offset_bytes: u64, data: &[u8]) -> Result<()> {
        self.check_handle(handle)?;
        self.check_range(offset_bytes, data.len())?;
        self.device
            .write_at(self.slot_offset(handle.0) + offset_bytes, data)
    }

    fn read_at(
        &self,
        handle: BlockHandle,
        offset_bytes: u64,
        size_bytes: usize,
    ) -> Result<Vec<u8>> {
        self.check_handle(handle)?;
        self.check_range(offset_bytes, size_bytes)?;
        self.device
            .read_at(self.slot_offset(handle.0) + offset_bytes, size_bytes)
    }

    fn device_offset(&self, handle: BlockHandle) -> Option<u64> {
        if handle.0 < self.slot_count {
            Some(self.slot_offset(handle.0))
        } else {
            None
        }
    }

    fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }

    fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryMappedBlockDevice;
    use tempfile::tempdir;

    fn open_allocator(slot_count: usize) -> (tempfile::TempDir, DeviceBackedBlockAllocator) {
        let dir = tempdir().unwrap();
        let device = Arc::new(
            MemoryMappedBlockDevice::open(&dir.path().join("blocks"), 1 << 20).unwrap(),
        );
        let allocator = DeviceBackedBlockAllocator::new(device, slot_count).unwrap();
        (dir, allocator)
    }

    #[test]
    fn test_partitioning_is_sector_aligned() {
        let (_dir, allocator) = open_allocator(4);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        let offset_a = allocator.device_offset(a).unwrap();
        let offset_b = allocator.device_offset(b).unwrap();
        assert_eq!(offset_b - offset_a, allocator.block_size_bytes());
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let (_dir, allocator) = open_allocator(2);
        allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert!(matches!(allocator.allocate(), Err(Error::Exhausted(_))));
        allocator.release(b);
        allocator.allocate().unwrap();
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, allocator) = open_allocator(4);
        let handle = allocator.allocate().unwrap();
        allocator.write_at(handle, 100, b"cached artifact").unwrap();
        assert_eq!(
            allocator.read_at(handle, 100, 15).unwrap(),
            b"cached artifact"
        );
    }

    #[test]
    fn test_block_range_enforced() {
        let (_dir, allocator) = open_allocator(4);
        let handle = allocator.allocate().unwrap();
        let size = allocator.block_size_bytes();
        assert!(matches!(
            allocator.write_at(handle, size - 1, b"xx"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(allocator.read_at(handle, size, 1).is_err());
    }

    #[test]
    fn test_reattach_at_offset() {
        let (_dir, allocator) = open_allocator(4);
        let handle = allocator.allocate().unwrap();
        let offset = allocator.device_offset(handle).unwrap();
        allocator.write_at(handle, 0, b"survivor").unwrap();

        // Occupied slots refuse reattachment.
        assert!(allocator.allocate_at(offset).is_none());

        allocator.release(handle);
        let reattached = allocator.allocate_at(offset).unwrap();
        assert_eq!(allocator.read_at(reattached, 0, 8).unwrap(), b"survivor");
    }

    #[test]
    fn test_reattach_rejects_bogus_offsets() {
        let (_dir, allocator) = open_allocator(4);
        // Misaligned.
        assert!(allocator.allocate_at(allocator.block_size_bytes() / 2).is_none());
        // Past the end of the pool.
        assert!(allocator
            .allocate_at(allocator.block_size_bytes() * 64)
            .is_none());
    }
}
