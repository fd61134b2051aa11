// Digests used as equality keys.
//
// Chunk digests are xxh3-64 seeded with the chunker seed; they identify a
// chunk for reuse detection only and carry no integrity guarantee.
// Path hashes are xxh3-128 of the logical path and name every on-disk log.

use std::fmt;
use std::str::FromStr;

use xxhash_rust::xxh3::{xxh3_128, xxh3_64_with_seed};

/// Digest of a chunk payload under a given seed.
#[inline]
pub fn chunk_digest(data: &[u8], seed: u64) -> u64 {
    xxh3_64_with_seed(data, seed)
}

/// Content hash for manifests (xxh3-128, big-endian bytes).
pub fn content_digest(data: &[u8]) -> [u8; 16] {
    xxh3_128(data).to_be_bytes()
}

// ---------------------------------------------------------------------------
// PathHash
// ---------------------------------------------------------------------------

/// Stable digest of a logical file path.
///
/// Storage never sees raw path strings; the first byte shards directories.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathHash([u8; 16]);

impl PathHash {
    pub fn from_path(path: &str) -> Self {
        Self(xxh3_128(path.as_bytes()).to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Shard prefix: the first byte of the digest.
    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathHash({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path hash {0:?}")]
pub struct ParsePathHashError(String);

impl FromStr for PathHash {
    type Err = ParsePathHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).map_err(|_| ParsePathHashError(s.to_string()))?;
        Ok(Self(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_is_stable_and_distinct() {
        let a = PathHash::from_path("a.txt");
        assert_eq!(a, PathHash::from_path("a.txt"));
        assert_ne!(a, PathHash::from_path("b.txt"));
    }

    #[test]
    fn hex_roundtrip() {
        let h = PathHash::from_path("src/lib.rs");
        let s = h.to_hex();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<PathHash>().unwrap(), h);
        assert_eq!(h.prefix(), h.as_bytes()[0]);
        assert!("zz".parse::<PathHash>().is_err());
    }

    #[test]
    fn chunk_digest_depends_on_seed() {
        assert_eq!(chunk_digest(b"abc", 1), chunk_digest(b"abc", 1));
        assert_ne!(chunk_digest(b"abc", 1), chunk_digest(b"abc", 2));
    }
}
