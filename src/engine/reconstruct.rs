// File reconstruction.
//
// Commit scope: the nearest commit record at or below the requested id
// defines the file; no record means the path did not exist (empty).
//
// Container scope: the base commit's bytes are the original.  The
// nearest container record at or below the requested change is replayed
// against them; with no record the base bytes are the answer.
//
// Requests past the published head read the head.

use std::io::{self, Write};

use super::{SyncEngine, SyncError};
use crate::delta::{self, Operation};
use crate::hash::PathHash;
use crate::store::{ContainerId, OpAddress, OperationLocation, ProjectId, Scope};

impl SyncEngine {
    /// Exact bytes of `path` at `version` of `scope`.
    pub fn regenerate_version(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Vec<u8>, SyncError> {
        let mut out = Vec::new();
        self.regenerate_into(scope, version, path, &mut out)?;
        Ok(out)
    }

    /// Stream the bytes of `path` at `version` into `out`, returning the length.
    pub fn regenerate_into<W: Write>(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        out: W,
    ) -> Result<u64, SyncError> {
        let original = match scope {
            Scope::Commit(_) => Vec::new(),
            Scope::Container(project, container) => self.base_bytes(project, container, path)?,
        };

        let Some((found, locs)) = self.visible_record(scope, version, path)? else {
            // Untouched in this scope: the original is the whole answer.
            return write_all_counted(out, &original);
        };
        log::trace!("{path} at {version} of {scope}: record from version {found}, {} ops", locs.len());

        let ops = locs.iter().map(|loc| self.load_operation(scope, path, loc));
        let stats = delta::apply(ops, io::Cursor::new(original), out)?;
        Ok(stats.block_bytes + stats.data_bytes)
    }

    /// Nearest published record of `path` at or below `version`.
    pub(crate) fn visible_record(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<(u64, Vec<OperationLocation>)>, SyncError> {
        match self.head(scope)? {
            Some(head) => Ok(self.locs.latest_at_or_before(scope, version.min(head), path)?),
            None => Ok(None),
        }
    }

    /// Bytes of `path` at the container's base commit.
    pub(crate) fn base_bytes(
        &self,
        project: ProjectId,
        container: ContainerId,
        path: PathHash,
    ) -> Result<Vec<u8>, SyncError> {
        match self.base_commit(project, container)? {
            Some(base) => self.regenerate_version(Scope::Commit(project), base, path),
            None => Ok(Vec::new()),
        }
    }

    /// Read the operation a location points at, from whichever log holds it.
    fn load_operation(
        &self,
        scope: Scope,
        path: PathHash,
        loc: &OperationLocation,
    ) -> Result<Operation, SyncError> {
        let (source, offset, length) = match (scope, loc.address) {
            (Scope::Container(..), OpAddress::Container { offset, length }) => (scope, offset, length),
            (_, OpAddress::Commit { offset, length }) => (Scope::Commit(scope.project()), offset, length),
            (Scope::Commit(_), OpAddress::Container { .. }) => {
                return Err(SyncError::Corruption {
                    path,
                    hash: loc.chunk_hash.hash,
                    detail: "commit record points into a container log".into(),
                });
            }
        };
        let op = self.data.read(source, path, offset, length)?;
        if !op.chunk_hash().same_content(&loc.chunk_hash) {
            return Err(SyncError::Corruption {
                path,
                hash: loc.chunk_hash.hash,
                detail: format!(
                    "record at {offset}+{length} in {source} holds chunk {:016x}",
                    op.chunk_hash().hash
                ),
            });
        }
        Ok(op)
    }
}

fn write_all_counted<W: Write>(mut out: W, bytes: &[u8]) -> Result<u64, SyncError> {
    out.write_all(bytes)?;
    out.flush()?;
    Ok(bytes.len() as u64)
}
