// Operation-Location Index.
//
// One record per (scope, version, path): the ordered addresses of the
// operations that rebuild that path at that version.  Versions are
// sparse per path, so lookups go through an ordered in-memory index
// (path -> set of versions) rather than trying the medium version by
// version.  `LocationIndex` hides the medium; `FsLocationIndex` keeps
// records as files, `MemoryLocationIndex` keeps them in maps.
//
// The index has no notion of a published head.  Records above the head
// the catalog holds are orphans of a failed publish; readers bound their
// lookups by the head and publishers clear them with `remove_above`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};

use parking_lot::RwLock;

use super::layout::{self, Layout};
use super::opdata::{read_dir_or_empty, remove_dir_if_present};
use super::{ContainerId, ProjectId, Scope, StoreError};
use crate::delta::codec::{CodecError, put_chunk_hash, read_chunk_hash};
use crate::delta::ops::ChunkHash;
use crate::delta::varint::{self, Cursor};
use crate::hash::PathHash;

// ---------------------------------------------------------------------------
// OperationLocation
// ---------------------------------------------------------------------------

/// Where an operation's record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpAddress {
    /// In the data log of the container that owns the record.
    Container { offset: u64, length: u64 },
    /// In the project's commit data log.
    Commit { offset: u64, length: u64 },
}

impl OpAddress {
    pub fn offset(&self) -> u64 {
        match *self {
            OpAddress::Container { offset, .. } | OpAddress::Commit { offset, .. } => offset,
        }
    }

    pub fn length(&self) -> u64 {
        match *self {
            OpAddress::Container { length, .. } | OpAddress::Commit { length, .. } => length,
        }
    }
}

/// One entry of a location record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationLocation {
    /// The chunk this operation produces, positioned in its own version.
    pub chunk_hash: ChunkHash,
    pub address: OpAddress,
}

const ADDR_CONTAINER: u8 = 0;
const ADDR_COMMIT: u8 = 1;

/// Serialise a location record: varint count, then per entry
/// `tag, offset, length, chunk_hash`.
pub fn encode_locations(locs: &[OperationLocation]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + locs.len() * 24);
    varint::put_u64(&mut out, locs.len() as u64);
    for loc in locs {
        let tag = match loc.address {
            OpAddress::Container { .. } => ADDR_CONTAINER,
            OpAddress::Commit { .. } => ADDR_COMMIT,
        };
        out.push(tag);
        varint::put_u64(&mut out, loc.address.offset());
        varint::put_u64(&mut out, loc.address.length());
        put_chunk_hash(&mut out, &loc.chunk_hash);
    }
    out
}

pub fn decode_locations(data: &[u8]) -> Result<Vec<OperationLocation>, CodecError> {
    let mut cur = Cursor::new(data);
    let count = cur.u64()?;
    // Every entry takes at least 11 bytes; don't trust the count for allocation.
    let mut locs = Vec::with_capacity((count as usize).min(data.len() / 11));
    for _ in 0..count {
        let tag = cur.u8()?;
        let offset = cur.u64()?;
        let length = cur.u64()?;
        let address = match tag {
            ADDR_CONTAINER => OpAddress::Container { offset, length },
            ADDR_COMMIT => OpAddress::Commit { offset, length },
            other => return Err(CodecError::UnknownTag(other)),
        };
        locs.push(OperationLocation {
            chunk_hash: read_chunk_hash(&mut cur)?,
            address,
        });
    }
    if !cur.is_empty() {
        return Err(CodecError::Trailing(cur.remaining()));
    }
    Ok(locs)
}

// ---------------------------------------------------------------------------
// LocationIndex
// ---------------------------------------------------------------------------

/// Storage of location records keyed by (scope, version, path).
pub trait LocationIndex: Send + Sync {
    /// Store the record for (`scope`, `version`, `path`).
    ///
    /// Re-inserting the same key replaces the record, so a retried push
    /// or merge converges instead of failing.
    fn insert(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        locs: &[OperationLocation],
    ) -> Result<(), StoreError>;

    /// Exact record for (`scope`, `version`, `path`).
    fn get(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<Vec<OperationLocation>>, StoreError>;

    /// Nearest record at or below `version`, with the version it was found at.
    fn latest_at_or_before(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<(u64, Vec<OperationLocation>)>, StoreError>;

    /// Highest version holding any record in `scope`, published or not.
    fn max_version(&self, scope: Scope) -> Result<Option<u64>, StoreError>;

    /// Every path with at least one record at or below `up_to`.
    fn touched_paths(&self, scope: Scope, up_to: u64) -> Result<BTreeSet<PathHash>, StoreError>;

    /// Paths with a record at exactly `version`.
    fn paths_at(&self, scope: Scope, version: u64) -> Result<BTreeSet<PathHash>, StoreError>;

    /// Drop the record for (`scope`, `version`, `path`) if there is one.
    fn remove(&self, scope: Scope, version: u64, path: PathHash) -> Result<(), StoreError>;

    /// Drop every record above `keep` (every record for `None`), returning
    /// how many were dropped.
    fn remove_above(&self, scope: Scope, keep: Option<u64>) -> Result<usize, StoreError>;

    fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), StoreError>;

    fn delete_project(&self, project: ProjectId) -> Result<(), StoreError>;
}

/// Ordered version index for one scope.
#[derive(Debug, Default)]
struct VersionIndex {
    by_path: HashMap<PathHash, BTreeSet<u64>>,
    by_version: BTreeMap<u64, BTreeSet<PathHash>>,
}

impl VersionIndex {
    fn add(&mut self, version: u64, path: PathHash) {
        self.by_path.entry(path).or_default().insert(version);
        self.by_version.entry(version).or_default().insert(path);
    }

    fn contains(&self, version: u64, path: PathHash) -> bool {
        self.by_path.get(&path).is_some_and(|v| v.contains(&version))
    }

    fn at_or_before(&self, version: u64, path: PathHash) -> Option<u64> {
        self.by_path.get(&path)?.range(..=version).next_back().copied()
    }

    fn max_version(&self) -> Option<u64> {
        self.by_version.keys().next_back().copied()
    }

    fn paths(&self, up_to: u64) -> BTreeSet<PathHash> {
        self.by_version
            .range(..=up_to)
            .flat_map(|(_, paths)| paths.iter().copied())
            .collect()
    }

    fn paths_at(&self, version: u64) -> BTreeSet<PathHash> {
        self.by_version.get(&version).cloned().unwrap_or_default()
    }

    fn versions_above(&self, keep: Option<u64>) -> Vec<u64> {
        let first = match keep {
            Some(keep) => match keep.checked_add(1) {
                Some(first) => first,
                None => return Vec::new(),
            },
            None => 0,
        };
        self.by_version.range(first..).map(|(&v, _)| v).collect()
    }

    fn remove(&mut self, version: u64, path: PathHash) -> bool {
        let Some(versions) = self.by_path.get_mut(&path) else {
            return false;
        };
        if !versions.remove(&version) {
            return false;
        }
        if versions.is_empty() {
            self.by_path.remove(&path);
        }
        if let Some(paths) = self.by_version.get_mut(&version) {
            paths.remove(&path);
            if paths.is_empty() {
                self.by_version.remove(&version);
            }
        }
        true
    }

    /// Forget every record at `version`, returning the paths it held.
    fn drop_version(&mut self, version: u64) -> BTreeSet<PathHash> {
        let paths = self.paths_at(version);
        for &path in &paths {
            self.remove(version, path);
        }
        paths
    }
}

fn drop_scopes<V>(map: &mut HashMap<Scope, V>, project: ProjectId, container: Option<ContainerId>) {
    map.retain(|scope, _| match (*scope, container) {
        (Scope::Container(p, c), Some(target)) => !(p == project && c == target),
        (_, Some(_)) => true,
        (s, None) => s.project() != project,
    });
}

// ---------------------------------------------------------------------------
// FsLocationIndex
// ---------------------------------------------------------------------------

/// File-backed index: one file per record, version index rebuilt lazily
/// per scope from the directory tree on first use.
pub struct FsLocationIndex {
    layout: Layout,
    scopes: RwLock<HashMap<Scope, VersionIndex>>,
}

impl FsLocationIndex {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn scan(&self, scope: Scope) -> Result<VersionIndex, StoreError> {
        let mut index = VersionIndex::default();
        for version_dir in read_dir_or_empty(&self.layout.loc_dir(scope))? {
            let version_dir = version_dir?;
            let Some(version) = layout::parse_version(&version_dir.file_name()) else {
                continue;
            };
            for shard in fs::read_dir(version_dir.path())? {
                let shard = shard?;
                if !shard.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard.path())? {
                    if let Some(path) = layout::parse_loc_record(&entry?.file_name()) {
                        index.add(version, path);
                    }
                }
            }
        }
        log::trace!(
            "loaded location index for {scope}: {} paths",
            index.by_path.len()
        );
        Ok(index)
    }

    /// Run `f` over the scope's index, loading it first if needed.
    fn with_index<T>(&self, scope: Scope, f: impl FnOnce(&VersionIndex) -> T) -> Result<T, StoreError> {
        if let Some(index) = self.scopes.read().get(&scope) {
            return Ok(f(index));
        }
        let mut scopes = self.scopes.write();
        if !scopes.contains_key(&scope) {
            let index = self.scan(scope)?;
            scopes.insert(scope, index);
        }
        Ok(f(&scopes[&scope]))
    }

    fn read_record(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Vec<OperationLocation>, StoreError> {
        let bytes = fs::read(self.layout.loc_record(scope, version, path))?;
        Ok(decode_locations(&bytes)?)
    }
}

impl LocationIndex for FsLocationIndex {
    fn insert(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        locs: &[OperationLocation],
    ) -> Result<(), StoreError> {
        // Make sure the index is loaded before the new file appears, or the
        // scan and the add below would race.
        self.with_index(scope, |_| ())?;

        let target = self.layout.loc_record(scope, version, path);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = target.with_extension("locs.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encode_locations(locs))?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &target)?;

        self.scopes.write().entry(scope).or_default().add(version, path);
        Ok(())
    }

    fn get(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<Vec<OperationLocation>>, StoreError> {
        if !self.with_index(scope, |idx| idx.contains(version, path))? {
            return Ok(None);
        }
        self.read_record(scope, version, path).map(Some)
    }

    fn latest_at_or_before(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<(u64, Vec<OperationLocation>)>, StoreError> {
        match self.with_index(scope, |idx| idx.at_or_before(version, path))? {
            Some(found) => Ok(Some((found, self.read_record(scope, found, path)?))),
            None => Ok(None),
        }
    }

    fn max_version(&self, scope: Scope) -> Result<Option<u64>, StoreError> {
        self.with_index(scope, VersionIndex::max_version)
    }

    fn touched_paths(&self, scope: Scope, up_to: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        self.with_index(scope, |idx| idx.paths(up_to))
    }

    fn paths_at(&self, scope: Scope, version: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        self.with_index(scope, |idx| idx.paths_at(version))
    }

    fn remove(&self, scope: Scope, version: u64, path: PathHash) -> Result<(), StoreError> {
        self.with_index(scope, |_| ())?;
        let mut scopes = self.scopes.write();
        match fs::remove_file(self.layout.loc_record(scope, version, path)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(index) = scopes.get_mut(&scope) {
            index.remove(version, path);
        }
        Ok(())
    }

    fn remove_above(&self, scope: Scope, keep: Option<u64>) -> Result<usize, StoreError> {
        self.with_index(scope, |_| ())?;
        let mut scopes = self.scopes.write();
        let Some(index) = scopes.get_mut(&scope) else {
            return Ok(0);
        };
        let mut dropped = 0;
        // Files go before index entries: the index never names a missing record.
        for version in index.versions_above(keep) {
            remove_dir_if_present(&self.layout.loc_version_dir(scope, version))?;
            dropped += index.drop_version(version).len();
        }
        if dropped > 0 {
            log::debug!("dropped {dropped} unpublished records above {keep:?} in {scope}");
        }
        Ok(dropped)
    }

    fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), StoreError> {
        let mut scopes = self.scopes.write();
        remove_dir_if_present(&self.layout.loc_dir(Scope::Container(project, container)))?;
        drop_scopes(&mut scopes, project, Some(container));
        Ok(())
    }

    fn delete_project(&self, project: ProjectId) -> Result<(), StoreError> {
        let mut scopes = self.scopes.write();
        remove_dir_if_present(&self.layout.project_dir(project).join("oplocs"))?;
        drop_scopes(&mut scopes, project, None);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryLocationIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryScope {
    index: VersionIndex,
    records: HashMap<(u64, PathHash), Vec<OperationLocation>>,
}

/// In-process index for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryLocationIndex {
    scopes: RwLock<HashMap<Scope, MemoryScope>>,
}

impl MemoryLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for MemoryLocationIndex {
    fn insert(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        locs: &[OperationLocation],
    ) -> Result<(), StoreError> {
        let mut scopes = self.scopes.write();
        let entry = scopes.entry(scope).or_default();
        entry.index.add(version, path);
        entry.records.insert((version, path), locs.to_vec());
        Ok(())
    }

    fn get(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<Vec<OperationLocation>>, StoreError> {
        Ok(self
            .scopes
            .read()
            .get(&scope)
            .and_then(|s| s.records.get(&(version, path)).cloned()))
    }

    fn latest_at_or_before(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<(u64, Vec<OperationLocation>)>, StoreError> {
        let scopes = self.scopes.read();
        let Some(s) = scopes.get(&scope) else {
            return Ok(None);
        };
        Ok(s.index
            .at_or_before(version, path)
            .and_then(|v| Some((v, s.records.get(&(v, path))?.clone()))))
    }

    fn max_version(&self, scope: Scope) -> Result<Option<u64>, StoreError> {
        Ok(self.scopes.read().get(&scope).and_then(|s| s.index.max_version()))
    }

    fn touched_paths(&self, scope: Scope, up_to: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        Ok(self
            .scopes
            .read()
            .get(&scope)
            .map(|s| s.index.paths(up_to))
            .unwrap_or_default())
    }

    fn paths_at(&self, scope: Scope, version: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        Ok(self
            .scopes
            .read()
            .get(&scope)
            .map(|s| s.index.paths_at(version))
            .unwrap_or_default())
    }

    fn remove(&self, scope: Scope, version: u64, path: PathHash) -> Result<(), StoreError> {
        if let Some(s) = self.scopes.write().get_mut(&scope) {
            s.index.remove(version, path);
            s.records.remove(&(version, path));
        }
        Ok(())
    }

    fn remove_above(&self, scope: Scope, keep: Option<u64>) -> Result<usize, StoreError> {
        let mut scopes = self.scopes.write();
        let Some(s) = scopes.get_mut(&scope) else {
            return Ok(0);
        };
        let mut dropped = 0;
        for version in s.index.versions_above(keep) {
            for path in s.index.drop_version(version) {
                s.records.remove(&(version, path));
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), StoreError> {
        drop_scopes(&mut self.scopes.write(), project, Some(container));
        Ok(())
    }

    fn delete_project(&self, project: ProjectId) -> Result<(), StoreError> {
        drop_scopes(&mut self.scopes.write(), project, None);
        Ok(())
    }
}
