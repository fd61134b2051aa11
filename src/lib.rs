//! Chunksync: content-defined chunking, positional delta sync and
//! layered operation-log storage for versioned project files.
//!
//! The crate provides:
//! - A deterministic FastCDC-style chunker (`chunker`, `hash`)
//! - Signature, diff and apply primitives (`delta`)
//! - Append-only operation-data logs and a location index (`store`)
//! - The sync engine: push, reconstruction and merge (`engine`)
//! - Project/container naming (`catalog`) and file manifests (`manifest`)
//! - File-oriented helpers (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use chunksync::chunker::Chunker;
//! use chunksync::delta;
//!
//! let chunker = Chunker::default();
//! let old = b"hello old world".to_vec();
//! let new = b"hello new world".to_vec();
//!
//! let signature = delta::build_signature(&chunker, old.as_slice()).unwrap();
//! let ops = delta::diff_all(&chunker, &new, &signature).unwrap();
//! let rebuilt = delta::apply_to_vec(&ops, &old).unwrap();
//! assert_eq!(rebuilt, new);
//! ```

pub mod catalog;
pub mod chunker;
pub mod delta;
pub mod engine;
pub mod hash;
pub mod io;
pub mod manifest;
pub mod store;

#[cfg(feature = "cli")]
pub mod cli;

pub use engine::{EngineOptions, MergeStats, SyncEngine, SyncError};
pub use hash::{ChunkerConfig, PathHash};
pub use store::{ChangeId, CommitId, ContainerId, ProjectId, Scope};
