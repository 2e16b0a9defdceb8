use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// Content digest identifying a blob: the SHA-256 of its bytes plus the
/// declared size. The digest is only ever used as a lookup key; it is never
/// dereferenced into storage directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: [u8; 32],
    size_bytes: u64,
}

impl Digest {
    pub fn new(hash: [u8; 32], size_bytes: u64) -> Self {
        Self { hash, size_bytes }
    }

    /// Computes the digest of a blob's contents.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: hasher.finalize().into(),
            size_bytes: data.len() as u64,
        }
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.hash {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "-{}", self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = Error;

    /// Parses the `<64 hex chars>-<size>` form produced by Display.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hex, size) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidArgument(format!("Malformed digest: {:?}", s)))?;
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "Digest hash must be 64 hex characters, got {:?}",
                hex
            )));
        }
        let mut hash = [0u8; 32];
        for (i, chunk) in hash.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidArgument(format!("Malformed digest hash: {:?}", hex)))?;
        }
        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| Error::InvalidArgument(format!("Malformed digest size: {:?}", size)))?;
        Ok(Self { hash, size_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_bytes_matches_declared_size() {
        let digest = Digest::of_bytes(b"hello world");
        assert_eq!(digest.size_bytes(), 11);

        // Well-known SHA-256 of "hello world".
        assert_eq!(
            digest.to_string(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9-11"
        );
    }

    #[test]
    fn test_display_parse_round_trip() {
        let digest = Digest::of_bytes(b"artifact contents");
        let parsed: Digest = digest.to_string().parse().unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!("not-a-digest".parse::<Digest>().is_err());
        assert!("abcd-12".parse::<Digest>().is_err()); // hash too short
        let hex = "00".repeat(32);
        assert!(format!("{}-x", hex).parse::<Digest>().is_err());
        assert!(format!("{}-42", hex).parse::<Digest>().is_ok());
    }

    #[test]
    fn test_distinct_content_distinct_digest() {
        assert_ne!(Digest::of_bytes(b"a"), Digest::of_bytes(b"b"));
        // Same bytes, same digest.
        assert_eq!(Digest::of_bytes(b"a"), Digest::of_bytes(b"a"));
    }
}
