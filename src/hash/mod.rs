// Hashing for content-defined chunking and storage keys.
//
// This module provides:
// - Chunker profiles (size bounds + seed)
// - The seeded gear rolling hash and FastCDC cut-point search
// - Chunk digests and path hashes

pub mod config;
pub mod digest;
pub mod rolling;

pub use config::{ChunkerConfig, ConfigError};
pub use digest::{PathHash, chunk_digest, content_digest};
pub use rolling::GearHasher;
