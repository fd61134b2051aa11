// Sync engine: ties chunking, deltas and the two storage tiers together.
//
// Provides the server-side operations of the system:
//   - push: record a container change from an uploaded operation stream
//   - reconstruct: rebuild any path at any commit or container version
//   - merge: fold a container's latest state into the next commit
//   - signatures and download deltas for clients
//   - project and container lifecycle, manifests
//
// Bulk work (multi-path push, merge) runs on the engine's worker pool,
// one path per task.  Location records are inserted only after every
// path of a batch has succeeded, and the batch becomes visible only when
// the catalog's head moves to it afterwards.  Reads never look past the
// published head.

mod merge;
mod push;
mod reconstruct;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{Catalog, CatalogError, JsonCatalog};
use crate::chunker::{ChunkError, Chunker};
use crate::delta::{self, ChunkHash, DeltaError, OperationStream};
use crate::hash::{ChunkerConfig, ConfigError, PathHash};
use crate::manifest::{FileMetadata, manifest_path_hash};
use crate::store::handles::DEFAULT_HANDLE_CAPACITY;
use crate::store::opdata::remove_dir_if_present;
use crate::store::{
    ChangeId, CommitId, ContainerId, FsLocationIndex, Layout, LocationIndex, OpDataStore,
    ProjectId, Scope, StoreError,
};

pub use merge::MergeStats;

/// File name of the catalog under the engine root.
pub const CATALOG_FILE: &str = "catalog.json";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for a `SyncEngine`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory all stores live under.
    pub root: PathBuf,
    /// Chunking profile used for signatures and merges.
    pub chunker: ChunkerConfig,
    /// Worker threads for multi-path push and merge.
    pub workers: usize,
    /// Open data-log handles kept per engine.
    pub handle_cache_capacity: usize,
    /// Slots in each download operation channel.
    pub channel_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("chunksync-data"),
            chunker: ChunkerConfig::default(),
            workers: 64,
            handle_cache_capacity: DEFAULT_HANDLE_CAPACITY,
            channel_capacity: delta::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid chunker profile: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An uploaded operation that does not describe its own payload.
    #[error("invalid operation for {path}: {detail}")]
    InvalidOperation { path: PathHash, detail: String },
    #[error("change {change} is older than published change {head}")]
    StaleChange { change: ChangeId, head: ChangeId },
    /// A stored reference that cannot be resolved.  Never recovered from.
    #[error("corrupt history for {path}: chunk {hash:016x}: {detail}")]
    Corruption {
        path: PathHash,
        hash: u64,
        detail: String,
    },
    #[error("cannot start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    opts: EngineOptions,
    chunker: Chunker,
    data: OpDataStore,
    locs: Arc<dyn LocationIndex>,
    catalog: Arc<dyn Catalog>,
    pool: rayon::ThreadPool,
    /// Serialises merges so commit ids stay linear.
    merge_lock: Mutex<()>,
    /// Serialises container publishes so a head never moves backwards.
    publish_lock: Mutex<()>,
}

impl SyncEngine {
    /// Open the file-backed engine rooted at `opts.root`.
    pub fn open(opts: EngineOptions) -> Result<Self, SyncError> {
        let layout = Layout::new(&opts.root);
        let locs = Arc::new(FsLocationIndex::new(layout));
        let catalog = Arc::new(JsonCatalog::open(opts.root.join(CATALOG_FILE))?);
        Self::with_parts(opts, locs, catalog)
    }

    /// Engine over caller-supplied index and catalog; data logs still live under `opts.root`.
    pub fn with_parts(
        opts: EngineOptions,
        locs: Arc<dyn LocationIndex>,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self, SyncError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.workers.max(1))
            .thread_name(|i| format!("chunksync-worker-{i}"))
            .build()?;
        log::debug!(
            "engine at {} (avg chunk {} B, {} workers)",
            opts.root.display(),
            opts.chunker.average_size(),
            opts.workers.max(1)
        );
        Ok(Self {
            chunker: Chunker::new(opts.chunker),
            data: OpDataStore::new(Layout::new(&opts.root), opts.handle_cache_capacity),
            locs,
            catalog,
            pool,
            merge_lock: Mutex::new(()),
            publish_lock: Mutex::new(()),
            opts,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn data_store(&self) -> &OpDataStore {
        &self.data
    }

    pub fn location_index(&self) -> &dyn LocationIndex {
        self.locs.as_ref()
    }

    // -----------------------------------------------------------------------
    // Projects and containers
    // -----------------------------------------------------------------------

    pub fn create_project(&self, name: &str) -> Result<ProjectId, SyncError> {
        Ok(self.catalog.create_project(name)?)
    }

    pub fn project_id(&self, name: &str) -> Result<ProjectId, SyncError> {
        Ok(self.catalog.project_id(name)?)
    }

    /// Create a container pinned to the project's current commit.
    pub fn create_container(&self, project: ProjectId, name: &str) -> Result<ContainerId, SyncError> {
        let base = self.current_commit(project)?;
        let id = self.catalog.create_container(project, name, base)?;
        log::debug!("container {name:?} ({id}) of project {project} based on {base:?}");
        Ok(id)
    }

    pub fn container_id(&self, project: ProjectId, name: &str) -> Result<ContainerId, SyncError> {
        Ok(self.catalog.container_id(project, name)?)
    }

    /// The commit a container was created from; fixed for its lifetime.
    pub fn base_commit(&self, project: ProjectId, container: ContainerId) -> Result<Option<CommitId>, SyncError> {
        Ok(self.catalog.container(project, container)?.base_commit)
    }

    /// Latest published commit of `project`, `None` before the first merge.
    pub fn current_commit(&self, project: ProjectId) -> Result<Option<CommitId>, SyncError> {
        Ok(self.catalog.commit_head(project)?)
    }

    /// Latest published change of a container, `None` if nothing was pushed.
    pub fn current_change(&self, project: ProjectId, container: ContainerId) -> Result<Option<ChangeId>, SyncError> {
        Ok(self.catalog.container(project, container)?.head_change)
    }

    /// Published head of `scope`.
    pub(crate) fn head(&self, scope: Scope) -> Result<Option<u64>, SyncError> {
        match scope {
            Scope::Commit(project) => self.current_commit(project),
            Scope::Container(project, container) => self.current_change(project, container),
        }
    }

    /// Drop unpublished records above `head`.  They are already invisible,
    /// so a failure here is only logged.
    pub(crate) fn discard_above(&self, scope: Scope, head: Option<u64>) {
        match self.locs.remove_above(scope, head) {
            Ok(0) => {}
            Ok(n) => log::debug!("discarded {n} unpublished records in {scope}"),
            Err(e) => log::warn!("unpublished records above {head:?} in {scope} left in place: {e}"),
        }
    }

    pub fn next_change(&self, project: ProjectId, container: ContainerId) -> Result<ChangeId, SyncError> {
        Ok(self.current_change(project, container)?.map_or(0, |c| c + 1))
    }

    /// Remove a container.  The catalog entry goes first; once it is gone
    /// the container's records and logs are unreachable.
    pub fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), SyncError> {
        self.catalog.remove_container(project, container)?;
        self.locs.delete_container(project, container)?;
        self.data.delete_container(project, container)?;
        log::debug!("deleted container {container} of project {project}");
        Ok(())
    }

    /// Remove a project with all of its commits and containers.
    pub fn delete_project(&self, project: ProjectId) -> Result<(), SyncError> {
        self.catalog.remove_project(project)?;
        self.locs.delete_project(project)?;
        self.data.delete_project(project)?;
        remove_dir_if_present(&self.data.layout().project_dir(project))?;
        log::debug!("deleted project {project}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signatures and downloads
    // -----------------------------------------------------------------------

    pub fn commit_signature(
        &self,
        project: ProjectId,
        commit: CommitId,
        path: PathHash,
    ) -> Result<Vec<ChunkHash>, SyncError> {
        self.signature(Scope::Commit(project), commit, path)
    }

    pub fn container_signature(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        path: PathHash,
    ) -> Result<Vec<ChunkHash>, SyncError> {
        self.signature(Scope::Container(project, container), change, path)
    }

    fn signature(&self, scope: Scope, version: u64, path: PathHash) -> Result<Vec<ChunkHash>, SyncError> {
        let bytes = self.regenerate_version(scope, version, path)?;
        Ok(delta::build_signature(&self.chunker, bytes.as_slice())?)
    }

    /// Delta that turns a client's copy (described by `client_signature`)
    /// into the path's bytes at `version`.
    pub fn read_delta(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        client_signature: Vec<ChunkHash>,
    ) -> Result<OperationStream, SyncError> {
        let bytes = self.regenerate_version(scope, version, path)?;
        Ok(delta::diff_stream(
            &self.chunker,
            io::Cursor::new(bytes),
            client_signature,
            self.opts.channel_capacity,
        ))
    }

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    /// Record `manifest` as part of a container change.  Use `write_change`
    /// to publish it together with the files it describes.
    pub fn write_manifest(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
        manifest: &FileMetadata,
    ) -> Result<delta::DeltaStats, SyncError> {
        let json = manifest.to_json()?;
        self.write_file(project, container, change, manifest_path_hash(), &json)
    }

    /// Manifest at a commit or container version; empty if none was recorded.
    pub fn read_manifest(&self, scope: Scope, version: u64) -> Result<FileMetadata, SyncError> {
        let bytes = self.regenerate_version(scope, version, manifest_path_hash())?;
        Ok(FileMetadata::from_json(&bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
