use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::block::BlockDescriptor;
use crate::error::{Error, Result};

const STATE_FILE: &str = "state";
const STATE_TEMP_FILE: &str = "state.tmp";
const STATE_MAGIC: &[u8; 4] = b"KSTC";
const STATE_VERSION: u32 = 1;

/// The minimum information needed to reattach a previous lifetime's block
/// list and key-location map without rescanning storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentState {
    pub hash_seed: u64,
    pub oldest_epoch_id: u64,
    /// Lower bound for block ids of the next lifetime. Always above any
    /// id this lifetime could have handed out.
    pub next_block_id: u64,
    pub blocks: Vec<BlockDescriptor>,
}

impl PersistentState {
    /// `magic | version | seed | oldest epoch | next block id | count |
    /// descriptors | crc64`, little endian throughout.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(STATE_MAGIC);
        bytes.write_u32::<LittleEndian>(STATE_VERSION)?;
        bytes.write_u64::<LittleEndian>(self.hash_seed)?;
        bytes.write_u64::<LittleEndian>(self.oldest_epoch_id)?;
        bytes.write_u64::<LittleEndian>(self.next_block_id)?;
        bytes.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        for block in &self.blocks {
            bytes.write_u64::<LittleEndian>(block.block_id)?;
            bytes.write_u64::<LittleEndian>(block.device_offset_bytes)?;
            bytes.write_u64::<LittleEndian>(block.write_epoch_id)?;
            bytes.write_u64::<LittleEndian>(block.sealed_fill_bytes)?;
        }

        let mut digest = crc64fast::Digest::new();
        digest.write(&bytes);
        bytes.write_u64::<LittleEndian>(digest.sum64())?;
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATE_MAGIC.len() + 4 + 8 {
            return Err(Error::IntegrityViolation(
                "state snapshot truncated".to_string(),
            ));
        }

        let (payload, checksum_bytes) = bytes.split_at(bytes.len() - 8);
        let stored_checksum = u64::from_le_bytes(
            checksum_bytes
                .try_into()
                .map_err(|_| Error::IntegrityViolation("state snapshot truncated".to_string()))?,
        );
        let mut digest = crc64fast::Digest::new();
        digest.write(payload);
        if digest.sum64() != stored_checksum {
            return Err(Error::IntegrityViolation(
                "state snapshot checksum mismatch".to_string(),
            ));
        }

        let mut cursor = Cursor::new(payload);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic).map_err(integrity)?;
        if &magic != STATE_MAGIC {
            return Err(Error::IntegrityViolation(format!(
                "state snapshot has unknown magic {:?}",
                magic
            )));
        }
        let version = cursor.read_u32::<LittleEndian>().map_err(integrity)?;
        if version != STATE_VERSION {
            return Err(Error::IntegrityViolation(format!(
                "unsupported state snapshot version {}",
                version
            )));
        }

        let hash_seed = cursor.read_u64::<LittleEndian>().map_err(integrity)?;
        let oldest_epoch_id = cursor.read_u64::<LittleEndian>().map_err(integrity)?;
        let next_block_id = cursor.read_u64::<LittleEndian>().map_err(integrity)?;
        let block_count = cursor.read_u32::<LittleEndian>().map_err(integrity)?;
        let mut blocks = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            blocks.push(BlockDescriptor {
                block_id: cursor.read_u64::<LittleEndian>().map_err(integrity)?,
                device_offset_bytes: cursor.read_u64::<LittleEndian>().map_err(integrity)?,
                write_epoch_id: cursor.read_u64::<LittleEndian>().map_err(integrity)?,
                sealed_fill_bytes: cursor.read_u64::<LittleEndian>().map_err(integrity)?,
            });
        }

        Ok(Self {
            hash_seed,
            oldest_epoch_id,
            next_block_id,
            blocks,
        })
    }
}

fn integrity(err: io::Error) -> Error {
    Error::IntegrityViolation(format!("state snapshot unreadable: {}", err))
}

/// Durable snapshot storage in a local directory, with atomic replace
/// semantics: a reader sees either the previous snapshot or the new one,
/// never a partial write.
pub struct DirectoryBackedPersistentStateStore {
    directory: PathBuf,
}

impl DirectoryBackedPersistentStateStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn state_path(&self) -> PathBuf {
        self.directory.join(STATE_FILE)
    }

    /// `None` means no snapshot exists: start fresh with a new seed.
    pub fn read(&self) -> Result<Option<PersistentState>> {
        let bytes = match fs::read(self.state_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        PersistentState::decode(&bytes).map(Some)
    }

    /// Writes to a temp file in the same directory, syncs it, renames it
    /// over the final name, then syncs the directory entry.
    pub fn write(&self, state: &PersistentState) -> Result<()> {
        let temp_path = self.directory.join(STATE_TEMP_FILE);
        let bytes = state.encode()?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.state_path())?;
        File::open(&self.directory)?.sync_all()?;
        Ok(())
    }
}
