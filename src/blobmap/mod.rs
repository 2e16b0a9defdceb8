use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::block::{AnyBlockList, BlockList, RestoredBlock};
use crate::config::RefreshPolicy;
use crate::error::{Error, Result};
use crate::keymap::{Location, LocationValidator};

/// Logical age class of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Old,
    Current,
    New,
}

/// Registry of live block ids and the byte limit up to which each block's
/// contents are valid. Shared between the location-blob map (which owns
/// the lifecycle) and the key-location map (which filters stale records
/// against it on every probe).
///
/// Runtime blocks are valid over their whole capacity; blocks reattached
/// from a previous lifetime only up to the fill their last durable
/// snapshot sealed.
pub struct LiveBlockRegistry {
    limits: RwLock<BTreeMap<u64, u64>>,
}

impl LiveBlockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            limits: RwLock::new(BTreeMap::new()),
        })
    }

    fn insert(&self, block_id: u64, limit_bytes: u64) {
        if let Ok(mut limits) = self.limits.write() {
            limits.insert(block_id, limit_bytes);
        }
    }

    fn remove(&self, block_id: u64) {
        if let Ok(mut limits) = self.limits.write() {
            limits.remove(&block_id);
        }
    }
}

impl LocationValidator for LiveBlockRegistry {
    fn is_live(&self, location: &Location) -> bool {
        let limits = match self.limits.read() {
            Ok(limits) => limits,
            Err(_) => return false,
        };
        match limits.get(&location.block_id) {
            Some(&limit) => match location.offset_bytes.checked_add(location.size_bytes) {
                Some(end) => end <= limit,
                None => false,
            },
            None => false,
        }
    }
}

/// Organizes live block space into three generations. Writes land in the
/// newest `new` block; when the `new` generation is at capacity and its
/// last block is full, the generations rotate: `new` becomes `current`,
/// `current` becomes `old`, and the previous `old` blocks are released.
/// Rotation reassigns tags only; no data moves.
///
/// The block list is ordered oldest first, so the generations are simply
/// three consecutive runs of the list, tracked by two boundary counts.
pub struct OldCurrentNewLocationBlobMap {
    list: AnyBlockList,
    registry: Arc<LiveBlockRegistry>,
    refresh_policy: RefreshPolicy,
    new_block_capacity: usize,
    old_count: usize,
    current_count: usize,
}

impl OldCurrentNewLocationBlobMap {
    /// `restored` blocks (from a previous lifetime) all enter `old`: their
    /// age is unknown, and old-generation reads are promoted by the
    /// default policy, so live content migrates forward organically.
    pub fn new(
        list: AnyBlockList,
        registry: Arc<LiveBlockRegistry>,
        refresh_policy: RefreshPolicy,
        new_block_capacity: usize,
        restored: &[RestoredBlock],
    ) -> Self {
        for block in restored {
            registry.insert(block.block_id, block.validated_fill_bytes);
        }
        Self {
            list,
            registry,
            refresh_policy,
            new_block_capacity,
            old_count: restored.len(),
            current_count: 0,
        }
    }

    pub fn list(&self) -> &AnyBlockList {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut AnyBlockList {
        &mut self.list
    }

    fn new_count(&self) -> usize {
        self.list.block_count() - self.old_count - self.current_count
    }

    /// Generation of the block a location points into, or `None` when the
    /// block has been released.
    pub fn generation_of(&self, location: &Location) -> Option<Generation> {
        let index = self.list.index_of(location.block_id)?;
        if index < self.old_count {
            Some(Generation::Old)
        } else if index < self.old_count + self.current_count {
            Some(Generation::Current)
        } else {
            Some(Generation::New)
        }
    }

    /// Whether a read hit in this generation should be re-written into
    /// `new` so it resists eviction.
    pub fn should_refresh(&self, generation: Generation) -> bool {
        match self.refresh_policy {
            RefreshPolicy::Never => false,
            RefreshPolicy::OldOnly => generation == Generation::Old,
            RefreshPolicy::OldAndCurrent => {
                matches!(generation, Generation::Old | Generation::Current)
            }
        }
    }

    pub fn get(&self, location: &Location) -> Result<Vec<u8>> {
        let index = self.list.index_of(location.block_id).ok_or(Error::NotFound)?;
        self.list
            .read(index, location.offset_bytes, location.size_bytes as usize)
    }

    /// Writes a blob into the `new` generation, rotating first if it is
    /// full, and returns where the bytes landed.
    pub fn put(&mut self, data: &[u8]) -> Result<Location> {
        let size_bytes = data.len() as u64;
        if size_bytes > self.list.block_size_bytes() {
            return Err(Error::InvalidArgument(format!(
                "blob of {} bytes exceeds block capacity {}",
                size_bytes,
                self.list.block_size_bytes()
            )));
        }

        let needs_block = match self.newest_writable_index() {
            Some(index) => !self.list.has_space(index, size_bytes),
            None => true,
        };
        if needs_block {
            if self.new_count() >= self.new_block_capacity {
                self.rotate();
            }
            let block_id = self.list.push_back()?;
            self.registry.insert(block_id, self.list.block_size_bytes());
        }

        let index = self.list.block_count() - 1;
        let offset_bytes = self.list.reserve(index, size_bytes)?;
        self.list.write(index, offset_bytes, data)?;
        Ok(Location {
            block_id: self.list.block_id(index),
            offset_bytes,
            size_bytes,
        })
    }

    fn newest_writable_index(&self) -> Option<usize> {
        if self.new_count() == 0 {
            None
        } else {
            Some(self.list.block_count() - 1)
        }
    }

    /// `new` -> `current` -> `old` -> released. The released blocks' ids
    /// leave the registry, which is what turns their location records
    /// stale.
    fn rotate(&mut self) {
        let released = self.old_count;
        let promoted_to_old = self.current_count;
        let promoted_to_current = self.new_count();
        for _ in 0..released {
            if let Some(block_id) = self.list.pop_front() {
                self.registry.remove(block_id);
            }
        }
        tracing::info!(
            released_blocks = released,
            promoted_to_old,
            promoted_to_current,
            "Rotating generations"
        );
        self.old_count = promoted_to_old;
        self.current_count = promoted_to_current;
    }

    #[cfg(test)]
    fn generation_counts(&self) -> (usize, usize, usize) {
        (self.old_count, self.current_count, self.new_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{InMemoryBlockAllocator, VolatileBlockList};

    /// Three generations of one block each, every block holding two
    /// 4-byte blobs.
    fn blob_map(policy: RefreshPolicy) -> OldCurrentNewLocationBlobMap {
        let allocator = Arc::new(InMemoryBlockAllocator::new(8, 8));
        let list = AnyBlockList::Volatile(VolatileBlockList::new(allocator));
        OldCurrentNewLocationBlobMap::new(list, LiveBlockRegistry::new(), policy, 1, &[])
    }

    #[test]
    fn test_put_lands_in_new_generation() {
        let mut map = blob_map(RefreshPolicy::OldOnly);
        let location = map.put(b"aaaa").unwrap();
        assert_eq!(map.generation_of(&location), Some(Generation::New));
        assert_eq!(map.get(&location).unwrap(), b"aaaa");
        assert_eq!(map.generation_counts(), (0, 0, 1));
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let mut map = blob_map(RefreshPolicy::OldOnly);
        assert!(matches!(
            map.put(b"way too big for an 8-byte block"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rotation_reassigns_tags_and_releases_old() {
        let mut map = blob_map(RefreshPolicy::OldOnly);
        let a = map.put(b"aaaa").unwrap();
        let b = map.put(b"bbbb").unwrap();

        // First block full; the next put pushes a fresh block, making the
        // previous one current.
        let c = map.put(b"cccc").unwrap();
        assert_eq!(map.generation_of(&a), Some(Generation::Current));
        assert_eq!(map.generation_of(&c), Some(Generation::New));
        assert_eq!(map.generation_counts(), (0, 1, 1));

        // Two more blobs fill and replace the new block: current -> old.
        let _d = map.put(b"dddd").unwrap();
        let e = map.put(b"eeee").unwrap();
        assert_eq!(map.generation_of(&a), Some(Generation::Old));
        assert_eq!(map.generation_counts(), (1, 1, 1));

        // The next rotation finally releases the old generation.
        let _f = map.put(b"ffff").unwrap();
        let g = map.put(b"gggg").unwrap();
        assert_eq!(map.generation_of(&a), None);
        assert!(matches!(map.get(&a), Err(Error::NotFound)));
        assert!(matches!(map.get(&b), Err(Error::NotFound)));

        // Blobs in surviving generations are untouched.
        assert_eq!(map.get(&c).unwrap(), b"cccc");
        assert_eq!(map.get(&e).unwrap(), b"eeee");
        assert_eq!(map.get(&g).unwrap(), b"gggg");
    }

    #[test]
    fn test_registry_tracks_liveness() {
        let mut map = blob_map(RefreshPolicy::OldOnly);
        let a = map.put(b"aaaa").unwrap();
        assert!(map.registry.is_live(&a));

        // Rotate a out.
        for data in [b"bbbb", b"cccc", b"dddd", b"eeee", b"ffff", b"gggg"] {
            map.put(data).unwrap();
        }
        assert!(!map.registry.is_live(&a));
    }

    #[test]
    fn test_registry_limit_bounds_restored_blocks() {
        let registry = LiveBlockRegistry::new();
        registry.insert(7, 100);
        let within = Location {
            block_id: 7,
            offset_bytes: 96,
            size_bytes: 4,
        };
        let beyond = Location {
            block_id: 7,
            offset_bytes: 96,
            size_bytes: 5,
        };
        assert!(registry.is_live(&within));
        assert!(!registry.is_live(&beyond));
        assert!(!registry.is_live(&Location {
            block_id: 7,
            offset_bytes: u64::MAX,
            size_bytes: 2,
        }));
    }

    #[test]
    fn test_refresh_policy_knob() {
        let map = blob_map(RefreshPolicy::Never);
        assert!(!map.should_refresh(Generation::Old));

        let map = blob_map(RefreshPolicy::OldOnly);
        assert!(map.should_refresh(Generation::Old));
        assert!(!map.should_refresh(Generation::Current));
        assert!(!map.should_refresh(Generation::New));

        let map = blob_map(RefreshPolicy::OldAndCurrent);
        assert!(map.should_refresh(Generation::Current));
        assert!(!map.should_refresh(Generation::New));
    }

    #[test]
    fn test_restored_blocks_enter_old_generation() {
        let allocator = Arc::new(InMemoryBlockAllocator::new(8, 8));
        let mut list = AnyBlockList::Volatile(VolatileBlockList::new(allocator));
        // Stand in for a reattached inventory: two live blocks whose ids
        // match the restored descriptors.
        list.push_back().unwrap();
        list.push_back().unwrap();
        let registry = LiveBlockRegistry::new();
        let restored = [
            RestoredBlock {
                block_id: 0,
                validated_fill_bytes: 8,
            },
            RestoredBlock {
                block_id: 1,
                validated_fill_bytes: 4,
            },
        ];
        let map = OldCurrentNewLocationBlobMap::new(
            list,
            registry.clone(),
            RefreshPolicy::OldOnly,
            1,
            &restored,
        );
        assert_eq!(map.generation_counts(), (2, 0, 0));
        assert!(registry.is_live(&Location {
            block_id: 1,
            offset_bytes: 0,
            size_bytes: 4,
        }));
    }
}
