mod hashing_map;
mod record_array;

pub use hashing_map::HashingKeyLocationMap;
pub use record_array::{
    DeviceBackedLocationRecordArray, InMemoryLocationRecordArray, LocationRecordArray,
    LOCATION_RECORD_SIZE,
};

/// Where a blob's bytes live. The generation class is not stored: it is
/// derived from the block id by the location-blob map, and a released
/// block's id never coming back is what makes old records stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub block_id: u64,
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

/// One slot of the key-location map: the key's hash plus the location it
/// resolves to. Slots are never cleared; stale records are filtered at
/// lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocationRecord {
    pub key_hash: u64,
    pub location: Location,
}

/// Decides whether a location record still points at live data. The
/// key-location map cannot tell on its own: generation reclamation leaves
/// slot bytes in place, so liveness is re-derived from the location-blob
/// map's block state on every probe. Implemented by the live-block
/// registry that the location-blob map maintains.
pub trait LocationValidator: Send + Sync {
    fn is_live(&self, location: &Location) -> bool;
}
