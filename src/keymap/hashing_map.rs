use std::sync::Arc;

use crate::digest::Digest;
use crate::error::{Error, Result};

use super::{Location, LocationRecord, LocationRecordArray, LocationValidator};

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Seeded FNV-1a over the digest's hash and declared size. The seed is
/// randomized per volatile instance and persisted per durable one, so two
/// stores never collide identically on crafted digests.
fn hash_key(seed: u64, key: &Digest) -> u64 {
    let mut h = seed;
    for &byte in key.hash() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    for &byte in &key.size_bytes().to_le_bytes() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Open-addressed map from digest keys to locations, with bounded linear
/// probing over a location record array.
///
/// Slots are never cleared: a record whose generation has been reclaimed
/// simply stops validating and is treated as empty. Lookups therefore
/// consult the location-blob map's liveness state (through the validator)
/// on every probe.
pub struct HashingKeyLocationMap {
    records: Box<dyn LocationRecordArray>,
    validator: Arc<dyn LocationValidator>,
    seed: u64,
    max_get_attempts: usize,
    max_put_attempts: usize,
}

impl HashingKeyLocationMap {
    pub fn new(
        records: Box<dyn LocationRecordArray>,
        validator: Arc<dyn LocationValidator>,
        seed: u64,
        max_get_attempts: usize,
        max_put_attempts: usize,
    ) -> Self {
        Self {
            records,
            validator,
            seed,
            max_get_attempts,
            max_put_attempts,
        }
    }

    fn slot(&self, hash: u64, attempt: usize) -> usize {
        ((hash.wrapping_add(attempt as u64)) % self.records.slot_count() as u64) as usize
    }

    /// Resolves a digest to its live location. Probing past the get budget
    /// without a match means the key is absent: insertions only ever place
    /// a key within the put budget of its home slot, and a cache may
    /// forget entries beyond the narrower get horizon.
    pub fn get(&self, key: &Digest) -> Result<Location> {
        let hash = hash_key(self.seed, key);
        for attempt in 0..self.max_get_attempts {
            let record = self.records.get(self.slot(hash, attempt))?;
            if record.key_hash == hash && self.validator.is_live(&record.location) {
                return Ok(record.location);
            }
        }
        Err(Error::NotFound)
    }

    /// Inserts or replaces the location for a digest. The first slot that
    /// holds the same key, or no live record at all, is overwritten.
    /// Exceeding the put budget is `Exhausted`: the table is under
    /// pressure, which is distinct from any statement about the key.
    pub fn put(&mut self, key: &Digest, location: Location) -> Result<()> {
        let hash = hash_key(self.seed, key);
        for attempt in 0..self.max_put_attempts {
            let index = self.slot(hash, attempt);
            let record = self.records.get(index)?;
            if record.key_hash == hash || !self.validator.is_live(&record.location) {
                return self.records.put(
                    index,
                    LocationRecord {
                        key_hash: hash,
                        location,
                    },
                );
            }
        }
        tracing::warn!(
            attempts = self.max_put_attempts,
            "Key-location map insertion ran out of probe attempts"
        );
        Err(Error::Exhausted("key-location map put attempts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::InMemoryLocationRecordArray;
    use std::collections::BTreeSet;
    use std::sync::RwLock;

    /// Test validator over an explicit set of live block ids.
    struct SetValidator {
        live: RwLock<BTreeSet<u64>>,
    }

    impl SetValidator {
        fn with(ids: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                live: RwLock::new(ids.iter().copied().collect()),
            })
        }

        fn retire(&self, id: u64) {
            self.live.write().unwrap().remove(&id);
        }
    }

    impl LocationValidator for SetValidator {
        fn is_live(&self, location: &Location) -> bool {
            self.live.read().unwrap().contains(&location.block_id)
        }
    }

    fn location(block_id: u64) -> Location {
        Location {
            block_id,
            offset_bytes: 16,
            size_bytes: 4,
        }
    }

    fn map_with(validator: Arc<SetValidator>, slots: usize) -> HashingKeyLocationMap {
        HashingKeyLocationMap::new(
            Box::new(InMemoryLocationRecordArray::new(slots)),
            validator,
            0x1234_5678,
            8,
            8,
        )
    }

    #[test]
    fn test_put_get_round_trip() {
        let validator = SetValidator::with(&[1]);
        let mut map = map_with(validator, 64);
        let key = Digest::of_bytes(b"artifact");

        assert!(matches!(map.get(&key), Err(Error::NotFound)));
        map.put(&key, location(1)).unwrap();
        assert_eq!(map.get(&key).unwrap(), location(1));
    }

    #[test]
    fn test_put_replaces_same_key() {
        let validator = SetValidator::with(&[1, 2]);
        let mut map = map_with(validator, 64);
        let key = Digest::of_bytes(b"artifact");

        map.put(&key, location(1)).unwrap();
        map.put(&key, location(2)).unwrap();
        assert_eq!(map.get(&key).unwrap(), location(2));
    }

    #[test]
    fn test_reclaimed_generation_reads_as_absent() {
        let validator = SetValidator::with(&[1]);
        let mut map = map_with(validator.clone(), 64);
        let key = Digest::of_bytes(b"artifact");

        map.put(&key, location(1)).unwrap();
        validator.retire(1);
        // The slot bytes are untouched, but the record no longer resolves.
        assert!(matches!(map.get(&key), Err(Error::NotFound)));
    }

    #[test]
    fn test_stale_slot_reused_by_insertion() {
        let validator = SetValidator::with(&[1, 2]);
        // Single slot: the second key can only land where the first did.
        let mut map = map_with(validator.clone(), 1);
        let first = Digest::of_bytes(b"first");
        let second = Digest::of_bytes(b"second");

        map.put(&first, location(1)).unwrap();
        assert!(matches!(
            map.put(&second, location(2)),
            Err(Error::Exhausted(_))
        ));

        validator.retire(1);
        map.put(&second, location(2)).unwrap();
        assert_eq!(map.get(&second).unwrap(), location(2));
    }

    #[test]
    fn test_probe_pressure_returns_exhausted() {
        let validator = SetValidator::with(&[1]);
        // Every key collides in a table this small; the probe budget (8)
        // is the real capacity.
        let mut map = HashingKeyLocationMap::new(
            Box::new(InMemoryLocationRecordArray::new(4)),
            validator,
            42,
            4,
            4,
        );

        let keys: Vec<Digest> = (0..5u8)
            .map(|i| Digest::of_bytes(&[i; 16]))
            .collect();
        for key in &keys[..4] {
            map.put(key, location(1)).unwrap();
        }
        assert!(matches!(
            map.put(&keys[4], location(1)),
            Err(Error::Exhausted(_))
        ));
        // Absent key stays NotFound, not Exhausted.
        assert!(matches!(
            map.get(&Digest::of_bytes(b"missing")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_seed_changes_slot_assignment() {
        let key = Digest::of_bytes(b"artifact");
        let h1 = hash_key(1, &key);
        let h2 = hash_key(2, &key);
        assert_ne!(h1, h2);
    }
}
