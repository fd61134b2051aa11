// Container merge.
//
// Each touched path is rebuilt at the container's latest change and
// diffed against the current commit's signature.  Data operations go
// into the project's commit log; Block operations copy the address the
// current commit already uses for that chunk, so unchanged bytes are
// shared between commits rather than rewritten.
//
// Every path's record is inserted only after all paths have been staged,
// and the new commit id is published by moving the project's head in the
// catalog after the last insert.  A failure before that point leaves the
// head, and so every reader, on the prior commit.  Deleting the merged
// container comes after publishing and cannot undo it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use super::{SyncEngine, SyncError};
use crate::delta::{self, ChunkHash, Operation};
use crate::hash::PathHash;
use crate::store::{CommitId, ContainerId, OpAddress, OperationLocation, ProjectId, Scope};

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MergeStats {
    /// The commit now current; unchanged if nothing was merged.
    pub commit: Option<CommitId>,
    /// Paths folded into the commit.
    pub paths: usize,
    /// Block operations whose address was carried over from the prior commit.
    pub reused_blocks: u64,
    /// Data operations written to the commit log.
    pub written_ops: u64,
    /// Record bytes appended to the commit log.
    pub written_bytes: u64,
}

struct StagedPath {
    path: PathHash,
    locs: Vec<OperationLocation>,
    reused: u64,
    written: u64,
}

impl SyncEngine {
    /// Fold a container into a new commit, returning the current commit id.
    pub fn merge(&self, project: ProjectId, container: ContainerId) -> Result<Option<CommitId>, SyncError> {
        Ok(self.merge_with_stats(project, container)?.commit)
    }

    pub fn merge_with_stats(
        &self,
        project: ProjectId,
        container: ContainerId,
    ) -> Result<MergeStats, SyncError> {
        let _guard = self.merge_lock.lock();

        let scope = Scope::Container(project, container);
        let prior = self.current_commit(project)?;
        let latest = self.current_change(project, container)?;
        let touched: BTreeSet<PathHash> = match latest {
            Some(latest) => self.locs.touched_paths(scope, latest)?,
            None => BTreeSet::new(),
        };
        let Some(latest) = latest.filter(|_| !touched.is_empty()) else {
            log::debug!("container {container} of project {project} has no changes; nothing to merge");
            return Ok(MergeStats {
                commit: prior,
                ..MergeStats::default()
            });
        };

        let commit = prior.map_or(0, |c| c + 1);
        let written_bytes = AtomicU64::new(0);

        let staged = self.pool.install(|| {
            touched
                .par_iter()
                .map(|&path| self.stage_merge(project, scope, latest, prior, path, &written_bytes))
                .collect::<Result<Vec<StagedPath>, SyncError>>()
        });
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                log::warn!(
                    "merge of container {container} into commit {commit} aborted: {e}; \
                     {} bytes left unreferenced in the commit log",
                    written_bytes.load(Ordering::Relaxed)
                );
                return Err(e);
            }
        };

        let mut stats = MergeStats {
            commit: Some(commit),
            paths: staged.len(),
            written_bytes: written_bytes.load(Ordering::Relaxed),
            ..MergeStats::default()
        };
        for s in &staged {
            stats.reused_blocks += s.reused;
            stats.written_ops += s.written;
        }

        let commit_scope = Scope::Commit(project);
        // Records of an earlier failed merge into the same id.
        self.locs.remove_above(commit_scope, prior)?;
        let published = staged
            .iter()
            .try_for_each(|s| self.locs.insert(commit_scope, commit, s.path, &s.locs))
            .map_err(SyncError::from)
            .and_then(|()| Ok(self.catalog.set_commit_head(project, commit)?));
        if let Err(e) = published {
            log::warn!(
                "merge of container {container} into commit {commit} not published: {e}; \
                 {} bytes left unreferenced in the commit log",
                stats.written_bytes
            );
            self.discard_above(commit_scope, prior);
            return Err(e);
        }

        if let Err(e) = self.delete_container(project, container) {
            log::warn!(
                "commit {commit} published but container {container} of project {project} not removed: {e}"
            );
        }
        log::info!(
            "merged container {container} of project {project} into commit {commit}: \
             {} paths, {} blocks reused, {} ops written ({} bytes)",
            stats.paths,
            stats.reused_blocks,
            stats.written_ops,
            stats.written_bytes
        );
        Ok(stats)
    }

    fn stage_merge(
        &self,
        project: ProjectId,
        scope: Scope,
        latest: u64,
        prior: Option<CommitId>,
        path: PathHash,
        written_bytes: &AtomicU64,
    ) -> Result<StagedPath, SyncError> {
        let content = self.regenerate_version(scope, latest, path)?;

        let (signature, known) = match prior {
            Some(prior) => {
                let signature = self.commit_signature(project, prior, path)?;
                let known: HashMap<ChunkHash, OpAddress> = self
                    .visible_record(Scope::Commit(project), prior, path)?
                    .map(|(_, locs)| locs.into_iter().map(|l| (l.chunk_hash, l.address)).collect())
                    .unwrap_or_default();
                (signature, known)
            }
            None => (Vec::new(), HashMap::new()),
        };

        let commit_scope = Scope::Commit(project);
        let mut staged = StagedPath {
            path,
            locs: Vec::new(),
            reused: 0,
            written: 0,
        };
        let mut out_offset = 0u64;
        for op in delta::diff(&self.chunker, content.as_slice(), &signature) {
            let op = op?;
            let address = match &op {
                Operation::Data(_) => {
                    let (offset, length) = self.data.write(commit_scope, path, &op)?;
                    written_bytes.fetch_add(length, Ordering::Relaxed);
                    staged.written += 1;
                    OpAddress::Commit { offset, length }
                }
                Operation::Block(chunk) => match known.get(chunk) {
                    Some(address @ OpAddress::Commit { .. }) => {
                        staged.reused += 1;
                        *address
                    }
                    _ => {
                        return Err(SyncError::Corruption {
                            path,
                            hash: chunk.hash,
                            detail: format!(
                                "chunk at {} of commit {prior:?} has no commit-log address",
                                chunk.offset
                            ),
                        });
                    }
                },
            };
            let length = op.output_len();
            staged.locs.push(OperationLocation {
                chunk_hash: ChunkHash {
                    offset: out_offset,
                    length,
                    ..op.chunk_hash()
                },
                address,
            });
            out_offset += length;
        }
        log::debug!(
            "merge staged {path}: {} reused, {} written",
            staged.reused,
            staged.written
        );
        Ok(staged)
    }
}
