use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

use super::{Location, LocationRecord};

/// On-device size of one record: key hash, block id, offset, size.
pub const LOCATION_RECORD_SIZE: usize = 32;

/// Fixed-capacity array of location records. Pure storage: hashing and
/// probing live in the key-location map built on top.
pub trait LocationRecordArray: Send + Sync {
    fn slot_count(&self) -> usize;
    fn get(&self, index: usize) -> Result<LocationRecord>;
    fn put(&mut self, index: usize, record: LocationRecord) -> Result<()>;
}

pub struct InMemoryLocationRecordArray {
    records: Vec<LocationRecord>,
}

impl InMemoryLocationRecordArray {
    pub fn new(slot_count: usize) -> Self {
        Self {
            records: vec![LocationRecord::default(); slot_count],
        }
    }
}

impl LocationRecordArray for InMemoryLocationRecordArray {
    fn slot_count(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Result<LocationRecord> {
        self.records
            .get(index)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("record index {} out of range", index)))
    }

    fn put(&mut self, index: usize, record: LocationRecord) -> Result<()> {
        match self.records.get_mut(index) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!(
                "record index {} out of range",
                index
            ))),
        }
    }
}

/// Record array over a memory-mapped block device. Slot `i` occupies the
/// fixed byte range `i * LOCATION_RECORD_SIZE ..`. Never-written slots read
/// as whatever the device held before; such garbage records are filtered
/// by the liveness check like any stale record.
pub struct DeviceBackedLocationRecordArray {
    device: Arc<dyn BlockDevice>,
    slot_count: usize,
}

impl DeviceBackedLocationRecordArray {
    pub fn new(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let slot_count = (device.size_bytes() / LOCATION_RECORD_SIZE as u64) as usize;
        if slot_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "device of {} bytes cannot hold a single {}-byte record",
                device.size_bytes(),
                LOCATION_RECORD_SIZE
            )));
        }
        Ok(Self { device, slot_count })
    }

    fn check_index(&self, index: usize) -> Result<u64> {
        if index >= self.slot_count {
            return Err(Error::InvalidArgument(format!(
                "record index {} out of range",
                index
            )));
        }
        Ok(index as u64 * LOCATION_RECORD_SIZE as u64)
    }
}

impl LocationRecordArray for DeviceBackedLocationRecordArray {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn get(&self, index: usize) -> Result<LocationRecord> {
        let offset = self.check_index(index)?;
        let bytes = self.device.read_at(offset, LOCATION_RECORD_SIZE)?;
        let mut cursor = Cursor::new(bytes);
        Ok(LocationRecord {
            key_hash: cursor.read_u64::<LittleEndian>()?,
            location: Location {
                block_id: cursor.read_u64::<LittleEndian>()?,
                offset_bytes: cursor.read_u64::<LittleEndian>()?,
                size_bytes: cursor.read_u64::<LittleEndian>()?,
            },
        })
    }

    fn put(&mut self, index: usize, record: LocationRecord) -> Result<()> {
        let offset = self.check_index(index)?;
        let mut bytes = Vec::with_capacity(LOCATION_RECORD_SIZE);
        bytes.write_u64::<LittleEndian>(record.key_hash)?;
        bytes.write_u64::<LittleEndian>(record.location.block_id)?;
        bytes.write_u64::<LittleEndian>(record.location.offset_bytes)?;
        bytes.write_u64::<LittleEndian>(record.location.size_bytes)?;
        self.device.write_at(offset, &bytes)
    }
}
