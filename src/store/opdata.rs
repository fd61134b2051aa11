// Operation-Data Store.
//
// Append-only logs of encoded operation records, one per (scope, path).
// `write` returns the (offset, length) the record landed at; `read`
// decodes the record back.  Offsets are captured under the log's own
// mutex, so writers on different paths never contend.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use super::handles::HandleCache;
use super::layout::{self, Layout};
use super::{ContainerId, ProjectId, Scope, StoreError};
use crate::delta::Operation;
use crate::delta::codec::{decode_operation, encode_operation};
use crate::hash::PathHash;

pub struct OpDataStore {
    layout: Layout,
    handles: HandleCache,
}

impl OpDataStore {
    pub fn new(layout: Layout, handle_capacity: usize) -> Self {
        Self {
            layout,
            handles: HandleCache::new(handle_capacity),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn handles(&self) -> &HandleCache {
        &self.handles
    }

    /// Append `op` to the log of (`scope`, `path`), returning its address.
    pub fn write(&self, scope: Scope, path: PathHash, op: &Operation) -> Result<(u64, u64), StoreError> {
        let mut record = Vec::new();
        encode_operation(op, &mut record);
        let log = self.handles.open_for_append(&self.layout.data_log(scope, path))?;
        let offset = log.append(&record)?;
        Ok((offset, record.len() as u64))
    }

    /// Read the record at (`offset`, `length`).
    pub fn read(
        &self,
        scope: Scope,
        path: PathHash,
        offset: u64,
        length: u64,
    ) -> Result<Operation, StoreError> {
        let log = self.handles.open_existing(&self.layout.data_log(scope, path))?;
        let record = log.read_at(offset, length)?;
        if (record.len() as u64) < length {
            return Err(StoreError::ShortRead {
                offset,
                expected: length,
                got: record.len() as u64,
            });
        }
        Ok(decode_operation(&record)?)
    }

    /// Paths that have a data log under `scope`.
    pub fn changed_paths(&self, scope: Scope) -> Result<BTreeSet<PathHash>, StoreError> {
        let mut out = BTreeSet::new();
        let root = self.layout.data_dir(scope);
        for shard in read_dir_or_empty(&root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if let Some(hash) = layout::parse_data_log(&entry.file_name()) {
                    out.insert(hash);
                }
            }
        }
        Ok(out)
    }

    pub fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), StoreError> {
        let dir = self.layout.data_dir(Scope::Container(project, container));
        self.handles.forget_under(&dir);
        remove_dir_if_present(&dir)
    }

    /// Remove every data log of `project`, commits and containers alike.
    pub fn delete_project(&self, project: ProjectId) -> Result<(), StoreError> {
        let dir = self.layout.project_dir(project).join("opdata");
        self.handles.forget_under(&dir);
        remove_dir_if_present(&dir)
    }
}

pub(crate) fn read_dir_or_empty(dir: &Path) -> io::Result<Box<dyn Iterator<Item = io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(rd) => Ok(Box::new(rd)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(e) => Err(e),
    }
}

pub(crate) fn remove_dir_if_present(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
