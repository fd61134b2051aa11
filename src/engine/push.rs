// Container pushes.
//
// A push records one change of one or more paths.  Data operations are
// checked against their payload and appended to the container's data
// log.  Block operations are not stored; they are resolved by chunk hash
// against the container's nearest earlier record, then the base commit's
// record, and the address found there is copied into the new record.  A
// Block that resolves nowhere means the client diffed against something
// this container never had.
//
// Publishing a change above the head inserts every record first and
// moves the container's head last.  Adding paths to the change at the
// head replaces records in place and puts the old ones back on failure.
// Changes below the head are sealed.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use super::{SyncEngine, SyncError};
use crate::delta::{self, ChunkHash, DeltaStats, Operation};
use crate::hash::{PathHash, chunk_digest};
use crate::store::{ChangeId, ContainerId, OpAddress, OperationLocation, ProjectId, Scope};

/// Addresses of the chunks a Block may refer to, loaded on first use.
struct BlockResolver<'e> {
    engine: &'e SyncEngine,
    project: ProjectId,
    container: ContainerId,
    change: ChangeId,
    path: PathHash,
    known: Option<HashMap<ChunkHash, OpAddress>>,
}

impl BlockResolver<'_> {
    fn resolve(&mut self, chunk: &ChunkHash) -> Result<OpAddress, SyncError> {
        if self.known.is_none() {
            self.known = Some(self.load()?);
        }
        self.known
            .as_ref()
            .and_then(|known| known.get(chunk).copied())
            .ok_or_else(|| SyncError::Corruption {
                path: self.path,
                hash: chunk.hash,
                detail: format!(
                    "block {}+{} of change {} not found in container {} or its base commit",
                    chunk.offset, chunk.length, self.change, self.container
                ),
            })
    }

    fn load(&self) -> Result<HashMap<ChunkHash, OpAddress>, SyncError> {
        let mut known = HashMap::new();

        if let Some(previous) = self.change.checked_sub(1) {
            let scope = Scope::Container(self.project, self.container);
            if let Some((_, prior)) = self.engine.visible_record(scope, previous, self.path)? {
                known.extend(prior.iter().map(|l| (l.chunk_hash, l.address)));
            }
        }
        if let Some(base) = self.engine.base_commit(self.project, self.container)? {
            let scope = Scope::Commit(self.project);
            if let Some((_, record)) = self.engine.visible_record(scope, base, self.path)? {
                for loc in record {
                    known.entry(loc.chunk_hash).or_insert(loc.address);
                }
            }
        }
        Ok(known)
    }
}

impl SyncEngine {
    /// Record change `change` of `path` from an uploaded operation stream.
    ///
    /// An empty stream records an empty file.
    pub fn write_operations<I, E>(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
        ops: I,
    ) -> Result<DeltaStats, SyncError>
    where
        I: IntoIterator<Item = Result<Operation, E>>,
        SyncError: From<E>,
    {
        let (locs, stats) = self.stage_push(project, container, change, path, ops)?;
        self.publish_change(project, container, change, &[(path, locs)])?;
        Ok(stats)
    }

    /// Push several paths as one change.  Records become visible only if
    /// every path's data was written.
    pub fn push_batch(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        files: Vec<(PathHash, Vec<Operation>)>,
    ) -> Result<DeltaStats, SyncError> {
        let staged = self.pool.install(|| {
            files
                .into_par_iter()
                .map(|(path, ops)| {
                    let (locs, stats) = self.stage_push(
                        project,
                        container,
                        change,
                        path,
                        ops.into_iter().map(Ok::<_, SyncError>),
                    )?;
                    Ok((path, locs, stats))
                })
                .collect::<Result<Vec<_>, SyncError>>()
        })?;

        let mut total = DeltaStats::default();
        let records: Vec<(PathHash, Vec<OperationLocation>)> = staged
            .into_iter()
            .map(|(path, locs, stats)| {
                total += stats;
                (path, locs)
            })
            .collect();
        self.publish_change(project, container, change, &records)?;
        log::debug!(
            "pushed change {change} of container {container}: {} paths, {} data bytes",
            records.len(),
            total.data_bytes
        );
        Ok(total)
    }

    /// Files, removals and anything else a client sends for one change,
    /// published together.  A path in both `files` and `removed` keeps
    /// its content.
    pub fn write_change(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        files: &[(PathHash, Vec<u8>)],
        removed: &[PathHash],
    ) -> Result<DeltaStats, SyncError> {
        let mut batch = self.pool.install(|| {
            files
                .par_iter()
                .map(|(path, content)| {
                    let signature = self.previous_signature(project, container, change, *path)?;
                    let ops = delta::diff_all(&self.chunker, content, &signature)?;
                    Ok((*path, ops))
                })
                .collect::<Result<Vec<_>, SyncError>>()
        })?;
        let written: HashSet<PathHash> = files.iter().map(|(path, _)| *path).collect();
        batch.extend(
            removed
                .iter()
                .filter(|path| !written.contains(path))
                .map(|&path| (path, Vec::new())),
        );
        self.push_batch(project, container, change, batch)
    }

    /// Diff `content` against the container's previous state of `path`
    /// and push the result as change `change`.
    pub fn write_file(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
        content: &[u8],
    ) -> Result<DeltaStats, SyncError> {
        let signature = self.previous_signature(project, container, change, path)?;
        let ops = delta::diff(&self.chunker, content, &signature);
        self.write_operations(project, container, change, path, ops)
    }

    /// `write_file` for several paths as one change, on the worker pool.
    pub fn write_files(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        files: &[(PathHash, Vec<u8>)],
    ) -> Result<DeltaStats, SyncError> {
        self.write_change(project, container, change, files, &[])
    }

    /// Signature of what a client held before `change`: the container's
    /// previous change, or the base commit for change 0.
    pub fn previous_signature(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
    ) -> Result<Vec<ChunkHash>, SyncError> {
        let previous = match change.checked_sub(1) {
            Some(prev) => self.regenerate_version(Scope::Container(project, container), prev, path)?,
            None => self.base_bytes(project, container, path)?,
        };
        Ok(delta::build_signature(&self.chunker, previous.as_slice())?)
    }

    /// Mark `path` as empty in change `change`.
    pub fn delete_file(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
    ) -> Result<(), SyncError> {
        self.write_operations(
            project,
            container,
            change,
            path,
            std::iter::empty::<Result<Operation, SyncError>>(),
        )?;
        Ok(())
    }

    /// Make the staged records of `change` visible.
    fn publish_change(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        records: &[(PathHash, Vec<OperationLocation>)],
    ) -> Result<(), SyncError> {
        let scope = Scope::Container(project, container);
        let _guard = self.publish_lock.lock();
        let head = self.current_change(project, container)?;
        match head {
            Some(head) if change < head => Err(SyncError::StaleChange { change, head }),
            Some(head) if change == head => self.replace_records(scope, change, records),
            _ => {
                // Records left by an earlier failed publish of this change.
                self.locs.remove_above(scope, head)?;
                let published = records
                    .iter()
                    .try_for_each(|(path, locs)| self.locs.insert(scope, change, *path, locs))
                    .map_err(SyncError::from)
                    .and_then(|()| Ok(self.catalog.set_change_head(project, container, change)?));
                if let Err(e) = published {
                    log::warn!("change {change} of container {container} not published: {e}");
                    self.discard_above(scope, head);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Overwrite records of the already published `change`, restoring the
    /// previous ones if any insert fails.
    fn replace_records(
        &self,
        scope: Scope,
        change: ChangeId,
        records: &[(PathHash, Vec<OperationLocation>)],
    ) -> Result<(), SyncError> {
        let mut replaced = Vec::with_capacity(records.len());
        let result = records.iter().try_for_each(|(path, locs)| {
            replaced.push((*path, self.locs.get(scope, change, *path)?));
            self.locs.insert(scope, change, *path, locs)
        });
        let Err(e) = result else {
            return Ok(());
        };
        for (path, previous) in replaced {
            let restored = match previous {
                Some(locs) => self.locs.insert(scope, change, path, &locs),
                None => self.locs.remove(scope, change, path),
            };
            if let Err(restore) = restored {
                log::warn!("{path} at change {change} of {scope} left half-replaced: {restore}");
            }
        }
        Err(e.into())
    }

    /// Write Data payloads and resolve Blocks, without publishing a record.
    fn stage_push<I, E>(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
        ops: I,
    ) -> Result<(Vec<OperationLocation>, DeltaStats), SyncError>
    where
        I: IntoIterator<Item = Result<Operation, E>>,
        SyncError: From<E>,
    {
        let scope = Scope::Container(project, container);
        let mut resolver = BlockResolver {
            engine: self,
            project,
            container,
            change,
            path,
            known: None,
        };
        let seed = self.chunker.config().seed();
        let mut stats = DeltaStats::default();
        let mut locs = Vec::new();
        // Records describe chunks where they land in this version, whatever
        // offset the client sent.
        let mut out_offset = 0u64;

        for op in ops {
            let op = op?;
            let (hash, address) = match &op {
                Operation::Data(chunk) => {
                    if chunk.length != chunk.data.len() as u64 {
                        return Err(SyncError::InvalidOperation {
                            path,
                            detail: format!(
                                "data at {out_offset} declares {} bytes but carries {}",
                                chunk.length,
                                chunk.data.len()
                            ),
                        });
                    }
                    let actual = chunk_digest(&chunk.data, seed);
                    if chunk.hash != actual {
                        return Err(SyncError::InvalidOperation {
                            path,
                            detail: format!(
                                "data at {out_offset} declares hash {:016x} but hashes to {actual:016x}",
                                chunk.hash
                            ),
                        });
                    }
                    let placed = Operation::data(out_offset, actual, chunk.data.clone());
                    let (offset, length) = self.data.write(scope, path, &placed)?;
                    (actual, OpAddress::Container { offset, length })
                }
                Operation::Block(chunk) => (chunk.hash, resolver.resolve(chunk)?),
            };
            stats.record(&op);
            let length = op.output_len();
            locs.push(OperationLocation {
                chunk_hash: ChunkHash {
                    offset: out_offset,
                    length,
                    hash,
                },
                address,
            });
            out_offset += length;
        }
        log::trace!(
            "staged {path} change {change}: {} blocks, {} data ops",
            stats.blocks,
            stats.data_ops
        );
        Ok((locs, stats))
    }
}
