// Layered operation-log storage.
//
// Two append-only tiers per project:
//
// - `opdata` — one byte log per (commit-or-container, path) holding
//   encoded operation records, addressed by (offset, length).
// - `oploc`  — one location record per (scope, version, path) listing
//   where each operation of that version's delta lives.
//
// Neither tier rewrites bytes in place.  A version needs its location
// records to be readable, but it is published by the head the catalog
// keeps; records above that head are ignored.

pub mod handles;
pub mod layout;
pub mod opdata;
pub mod oploc;

use std::fmt;
use std::io;

use crate::delta::codec::CodecError;

pub use handles::HandleCache;
pub use layout::Layout;
pub use opdata::OpDataStore;
pub use oploc::{FsLocationIndex, LocationIndex, MemoryLocationIndex, OpAddress, OperationLocation};

pub type ProjectId = u64;
pub type ContainerId = u64;
/// Commit ids start at 0 and grow by one per merge.
pub type CommitId = u64;
/// Change ids are per container, starting at 0.
pub type ChangeId = u64;

/// Which log family a store operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// The project's linear commit history.
    Commit(ProjectId),
    /// A branch or workspace overlay on top of one base commit.
    Container(ProjectId, ContainerId),
}

impl Scope {
    pub fn project(&self) -> ProjectId {
        match *self {
            Scope::Commit(p) | Scope::Container(p, _) => p,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Commit(p) => write!(f, "project {p} commits"),
            Scope::Container(p, c) => write!(f, "project {p} container {c}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Codec(#[from] CodecError),
    #[error("short read at offset {offset}: wanted {expected} bytes, got {got}")]
    ShortRead { offset: u64, expected: u64, got: u64 },
}
