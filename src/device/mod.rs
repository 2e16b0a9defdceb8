use std::fs::OpenOptions;
use std::path::Path;
use std::sync::RwLock;

use memmap2::MmapMut;

use crate::error::{Error, Result};

const FALLBACK_SECTOR_SIZE: usize = 4096;

/// Byte-addressed storage with a known sector geometry. The store computes
/// its block partitioning from the reported geometry; all offsets are
/// validated against the mapped range before any access.
pub trait BlockDevice: Send + Sync {
    fn sector_size_bytes(&self) -> usize;
    fn sector_count(&self) -> u64;

    fn read_at(&self, offset_bytes: u64, size_bytes: usize) -> Result<Vec<u8>>;
    fn write_at(&self, offset_bytes: u64, data: &[u8]) -> Result<()>;

    /// Forces durability of all writes issued so far.
    fn sync(&self) -> Result<()>;

    fn size_bytes(&self) -> u64 {
        self.sector_count() * self.sector_size_bytes() as u64
    }
}

/// A memory-mapped regular file or raw block device.
///
/// The inner lock is never contended in practice: every caller already
/// holds the store-wide lock in the matching mode. It exists so the mapping
/// can be written through `&self`.
pub struct MemoryMappedBlockDevice {
    mmap: RwLock<MmapMut>,
    sector_size_bytes: usize,
    sector_count: u64,
}

impl MemoryMappedBlockDevice {
    /// Opens (creating and extending as needed) a file of `size_bytes` and
    /// maps it read-write. The sector size is taken from the underlying
    /// filesystem's preferred I/O size.
    pub fn open(path: &Path, size_bytes: u64) -> Result<Self> {
        if size_bytes == 0 {
            return Err(Error::InvalidArgument(
                "device size must be non-zero".to_string(),
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let metadata = file.metadata()?;
        if metadata.len() < size_bytes {
            file.set_len(size_bytes)?;
        }

        let sector_size_bytes = preferred_sector_size(&metadata);
        let sector_count = size_bytes / sector_size_bytes as u64;
        if sector_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "device of {} bytes is smaller than one {}-byte sector",
                size_bytes, sector_size_bytes
            )));
        }

        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len((sector_count * sector_size_bytes as u64) as usize)
                .map_mut(&file)?
        };

        Ok(Self {
            mmap: RwLock::new(mmap),
            sector_size_bytes,
            sector_count,
        })
    }

    fn check_range(&self, offset_bytes: u64, size_bytes: usize) -> Result<()> {
        let end = offset_bytes
            .checked_add(size_bytes as u64)
            .ok_or_else(|| Error::InvalidArgument("device offset overflow".to_string()))?;
        if end > self.size_bytes() {
            return Err(Error::InvalidArgument(format!(
                "range {}..{} exceeds device size {}",
                offset_bytes,
                end,
                self.size_bytes()
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryMappedBlockDevice {
    fn sector_size_bytes(&self) -> usize {
        self.sector_size_bytes
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_at(&self, offset_bytes: u64, size_bytes: usize) -> Result<Vec<u8>> {
        self.check_range(offset_bytes, size_bytes)?;
        let mmap = self
            .mmap
            .read()
            .map_err(|_| Error::IntegrityViolation("device mapping lock poisoned".to_string()))?;
        let start = offset_bytes as usize;
        Ok(mmap[start..start + size_bytes].to_vec())
    }

    fn write_at(&self, offset_bytes: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset_bytes, data.len())?;
        let mut mmap = self
            .mmap
            .write()
            .map_err(|_| Error::IntegrityViolation("device mapping lock poisoned".to_string()))?;
        let start = offset_bytes as usize;
        mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mmap = self
            .mmap
            .read()
            .map_err(|_| Error::IntegrityViolation("device mapping lock poisoned".to_string()))?;
        mmap.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn preferred_sector_size(metadata: &std::fs::Metadata) -> usize {
    use std::os::unix::fs::MetadataExt;

    let blksize = metadata.blksize() as usize;
    if blksize == 0 {
        FALLBACK_SECTOR_SIZE
    } else {
        blksize
    }
}

#[cfg(not(unix))]
fn preferred_sector_size(_metadata: &std::fs::Metadata) -> usize {
    FALLBACK_SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_device(size_bytes: u64) -> (tempfile::TempDir, MemoryMappedBlockDevice) {
        let dir = tempdir().unwrap();
        let device =
            MemoryMappedBlockDevice::open(&dir.path().join("blocks"), size_bytes).unwrap();
        (dir, device)
    }

    #[test]
    fn test_geometry_reported() {
        let (_dir, device) = open_device(1 << 20);
        assert!(device.sector_size_bytes() > 0);
        assert!(device.sector_count() > 0);
        assert!(device.size_bytes() <= 1 << 20);
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, device) = open_device(1 << 20);
        device.write_at(4096, b"artifact bytes").unwrap();
        let read = device.read_at(4096, 14).unwrap();
        assert_eq!(read, b"artifact bytes");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let (_dir, device) = open_device(1 << 20);
        let size = device.size_bytes();
        assert!(matches!(
            device.write_at(size - 4, b"too long"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.read_at(size, 1),
            Err(Error::InvalidArgument(_))
        ));
        // Offset arithmetic must not wrap.
        assert!(device.read_at(u64::MAX, 16).is_err());
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks");
        {
            let device = MemoryMappedBlockDevice::open(&path, 1 << 20).unwrap();
            device.write_at(0, b"persistent").unwrap();
            device.sync().unwrap();
        }
        let device = MemoryMappedBlockDevice::open(&path, 1 << 20).unwrap();
        assert_eq!(device.read_at(0, 10).unwrap(), b"persistent");
    }

    #[test]
    fn test_zero_size_rejected() {
        let dir = tempdir().unwrap();
        assert!(MemoryMappedBlockDevice::open(&dir.path().join("blocks"), 0).is_err());
    }
}
