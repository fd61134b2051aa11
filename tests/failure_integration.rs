// Push and merge under failing storage.
//
// `FailingIndex` and `FailingCatalog` wrap the real implementations and
// fail selected calls once armed, so each test can break one step of a
// publish and check what readers see afterwards.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chunksync::catalog::{Catalog, CatalogError, ContainerInfo, JsonCatalog};
use chunksync::store::{
    ChangeId, CommitId, ContainerId, LocationIndex, MemoryLocationIndex, OperationLocation,
    ProjectId, StoreError,
};
use chunksync::{ChunkerConfig, EngineOptions, PathHash, Scope, SyncEngine, SyncError};
use tempfile::{TempDir, tempdir};

/// Fails the `fail_at`-th insert (1-based) into commit scopes, or into
/// container scopes, while armed.
struct FailingIndex {
    inner: MemoryLocationIndex,
    commits: bool,
    fail_at: usize,
    armed: AtomicBool,
    inserts: AtomicUsize,
}

impl FailingIndex {
    fn commits(fail_at: usize) -> Arc<Self> {
        Self::new(true, fail_at)
    }

    fn containers(fail_at: usize) -> Arc<Self> {
        Self::new(false, fail_at)
    }

    fn new(commits: bool, fail_at: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryLocationIndex::new(),
            commits,
            fail_at,
            armed: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
        })
    }

    fn arm(&self) {
        self.inserts.store(0, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl LocationIndex for FailingIndex {
    fn insert(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
        locs: &[OperationLocation],
    ) -> Result<(), StoreError> {
        let targeted = matches!(scope, Scope::Commit(_)) == self.commits;
        if targeted
            && self.armed.load(Ordering::SeqCst)
            && self.inserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at
        {
            return Err(StoreError::Io(io::Error::other("disk full")));
        }
        self.inner.insert(scope, version, path, locs)
    }

    fn get(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<Vec<OperationLocation>>, StoreError> {
        self.inner.get(scope, version, path)
    }

    fn latest_at_or_before(
        &self,
        scope: Scope,
        version: u64,
        path: PathHash,
    ) -> Result<Option<(u64, Vec<OperationLocation>)>, StoreError> {
        self.inner.latest_at_or_before(scope, version, path)
    }

    fn max_version(&self, scope: Scope) -> Result<Option<u64>, StoreError> {
        self.inner.max_version(scope)
    }

    fn touched_paths(&self, scope: Scope, up_to: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        self.inner.touched_paths(scope, up_to)
    }

    fn paths_at(&self, scope: Scope, version: u64) -> Result<BTreeSet<PathHash>, StoreError> {
        self.inner.paths_at(scope, version)
    }

    fn remove(&self, scope: Scope, version: u64, path: PathHash) -> Result<(), StoreError> {
        self.inner.remove(scope, version, path)
    }

    fn remove_above(&self, scope: Scope, keep: Option<u64>) -> Result<usize, StoreError> {
        self.inner.remove_above(scope, keep)
    }

    fn delete_container(&self, project: ProjectId, container: ContainerId) -> Result<(), StoreError> {
        self.inner.delete_container(project, container)
    }

    fn delete_project(&self, project: ProjectId) -> Result<(), StoreError> {
        self.inner.delete_project(project)
    }
}

/// Catalog whose `remove_container` fails while armed.
struct FailingCatalog {
    inner: JsonCatalog,
    armed: AtomicBool,
}

impl Catalog for FailingCatalog {
    fn create_project(&self, name: &str) -> Result<ProjectId, CatalogError> {
        self.inner.create_project(name)
    }

    fn project_id(&self, name: &str) -> Result<ProjectId, CatalogError> {
        self.inner.project_id(name)
    }

    fn create_container(
        &self,
        project: ProjectId,
        name: &str,
        base_commit: Option<CommitId>,
    ) -> Result<ContainerId, CatalogError> {
        self.inner.create_container(project, name, base_commit)
    }

    fn container_id(&self, project: ProjectId, name: &str) -> Result<ContainerId, CatalogError> {
        self.inner.container_id(project, name)
    }

    fn container(&self, project: ProjectId, container: ContainerId) -> Result<ContainerInfo, CatalogError> {
        self.inner.container(project, container)
    }

    fn containers(&self, project: ProjectId) -> Result<Vec<ContainerInfo>, CatalogError> {
        self.inner.containers(project)
    }

    fn remove_container(&self, project: ProjectId, container: ContainerId) -> Result<(), CatalogError> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(CatalogError::Io(io::Error::other("read-only catalog")));
        }
        self.inner.remove_container(project, container)
    }

    fn remove_project(&self, project: ProjectId) -> Result<(), CatalogError> {
        self.inner.remove_project(project)
    }

    fn commit_head(&self, project: ProjectId) -> Result<Option<CommitId>, CatalogError> {
        self.inner.commit_head(project)
    }

    fn set_commit_head(&self, project: ProjectId, commit: CommitId) -> Result<(), CatalogError> {
        self.inner.set_commit_head(project, commit)
    }

    fn set_change_head(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
    ) -> Result<(), CatalogError> {
        self.inner.set_change_head(project, container, change)
    }
}

fn options(dir: &TempDir) -> EngineOptions {
    EngineOptions {
        root: dir.path().to_path_buf(),
        chunker: ChunkerConfig::with_average(256).unwrap(),
        workers: 4,
        ..EngineOptions::default()
    }
}

fn engine_over(dir: &TempDir, index: Arc<FailingIndex>) -> SyncEngine {
    SyncEngine::with_parts(options(dir), index, Arc::new(JsonCatalog::ephemeral())).unwrap()
}

fn path(name: &str) -> PathHash {
    PathHash::from_path(name)
}

/// Project "demo" at commit 0 holding "a" and "b", plus a container "ws"
/// whose change 0 rewrites both.
fn project_with_pending_merge(engine: &SyncEngine) -> (ProjectId, ContainerId) {
    let project = engine.create_project("demo").unwrap();
    let seed = engine.create_container(project, "seed").unwrap();
    let base = [(path("a"), b"a0".to_vec()), (path("b"), b"b0".to_vec())];
    engine.write_files(project, seed, 0, &base).unwrap();
    assert_eq!(engine.merge(project, seed).unwrap(), Some(0));

    let ws = engine.create_container(project, "ws").unwrap();
    let edits = [(path("a"), b"a1".to_vec()), (path("b"), b"b1".to_vec())];
    engine.write_files(project, ws, 0, &edits).unwrap();
    (project, ws)
}

#[test]
fn merge_failing_mid_publish_keeps_prior_commit() {
    let dir = tempdir().unwrap();
    let index = FailingIndex::commits(2);
    let engine = engine_over(&dir, index.clone());
    let (project, ws) = project_with_pending_merge(&engine);
    let commits = Scope::Commit(project);

    index.arm();
    let result = engine.merge(project, ws);
    assert!(matches!(result, Err(SyncError::Store(StoreError::Io(_)))), "{result:?}");

    // Neither path of commit 1 is visible, and the one inserted was dropped.
    assert_eq!(engine.current_commit(project).unwrap(), Some(0));
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a0");
    assert_eq!(engine.regenerate_version(commits, 1, path("b")).unwrap(), b"b0");
    assert_eq!(index.max_version(commits).unwrap(), Some(0));

    // The container is untouched and can be merged again.
    assert_eq!(engine.container_id(project, "ws").unwrap(), ws);
    let scope = Scope::Container(project, ws);
    assert_eq!(engine.regenerate_version(scope, 0, path("a")).unwrap(), b"a1");

    index.disarm();
    assert_eq!(engine.merge(project, ws).unwrap(), Some(1));
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a1");
    assert_eq!(engine.regenerate_version(commits, 1, path("b")).unwrap(), b"b1");
}

#[test]
fn failed_merge_does_not_leak_into_the_next_commit() {
    let dir = tempdir().unwrap();
    let index = FailingIndex::commits(2);
    let engine = engine_over(&dir, index.clone());
    let (project, ws) = project_with_pending_merge(&engine);
    let commits = Scope::Commit(project);

    index.arm();
    assert!(engine.merge(project, ws).is_err());
    index.disarm();

    // A different container takes commit 1; nothing of "ws" shows up in it.
    let other = engine.create_container(project, "other").unwrap();
    engine.write_file(project, other, 0, path("c"), b"c1").unwrap();
    assert_eq!(engine.merge(project, other).unwrap(), Some(1));
    assert_eq!(index.paths_at(commits, 1).unwrap(), [path("c")].into_iter().collect());
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a0");
    assert_eq!(engine.regenerate_version(commits, 1, path("b")).unwrap(), b"b0");
}

#[test]
fn merge_failing_while_staging_keeps_prior_commit() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::open(options(&dir)).unwrap();
    let (project, ws) = project_with_pending_merge(&engine);
    let commits = Scope::Commit(project);

    // Lose the container's bytes for "b": rebuilding it cannot succeed.
    let log = engine.data_store().layout().data_log(Scope::Container(project, ws), path("b"));
    std::fs::OpenOptions::new().write(true).open(&log).unwrap().set_len(0).unwrap();

    let result = engine.merge(project, ws);
    assert!(matches!(result, Err(SyncError::Store(_))), "{result:?}");
    assert_eq!(engine.current_commit(project).unwrap(), Some(0));
    assert_eq!(engine.location_index().max_version(commits).unwrap(), Some(0));
    assert_eq!(engine.regenerate_version(commits, 1, path("a")).unwrap(), b"a0");
    assert_eq!(engine.container_id(project, "ws").unwrap(), ws);
    assert_eq!(engine.current_change(project, ws).unwrap(), Some(0));
}

#[test]
fn merge_survives_failed_container_cleanup() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(FailingCatalog {
        inner: JsonCatalog::ephemeral(),
        armed: AtomicBool::new(false),
    });
    let engine =
        SyncEngine::with_parts(options(&dir), Arc::new(MemoryLocationIndex::new()), catalog.clone()).unwrap();
    let (project, ws) = project_with_pending_merge(&engine);

    catalog.armed.store(true, Ordering::SeqCst);
    assert_eq!(engine.merge(project, ws).unwrap(), Some(1));
    assert_eq!(engine.current_commit(project).unwrap(), Some(1));
    assert_eq!(
        engine.regenerate_version(Scope::Commit(project), 1, path("b")).unwrap(),
        b"b1"
    );
    // Still listed; removing it is left for a later delete.
    assert_eq!(engine.container_id(project, "ws").unwrap(), ws);

    catalog.armed.store(false, Ordering::SeqCst);
    engine.delete_container(project, ws).unwrap();
    assert!(engine.container_id(project, "ws").is_err());
}

#[test]
fn push_failing_mid_publish_keeps_prior_change() {
    let dir = tempdir().unwrap();
    let index = FailingIndex::containers(2);
    let engine = engine_over(&dir, index.clone());
    let (project, ws) = project_with_pending_merge(&engine);
    let scope = Scope::Container(project, ws);

    index.arm();
    let edits = [(path("a"), b"a2".to_vec()), (path("b"), b"b2".to_vec())];
    let result = engine.write_files(project, ws, 1, &edits);
    assert!(matches!(result, Err(SyncError::Store(_))), "{result:?}");

    assert_eq!(engine.current_change(project, ws).unwrap(), Some(0));
    assert_eq!(engine.next_change(project, ws).unwrap(), 1);
    assert_eq!(engine.regenerate_version(scope, 1, path("a")).unwrap(), b"a1");
    assert_eq!(engine.regenerate_version(scope, 1, path("b")).unwrap(), b"b1");
    assert_eq!(index.max_version(scope).unwrap(), Some(0));

    index.disarm();
    engine.write_files(project, ws, 1, &edits).unwrap();
    assert_eq!(engine.regenerate_version(scope, 1, path("a")).unwrap(), b"a2");
    assert_eq!(engine.regenerate_version(scope, 1, path("b")).unwrap(), b"b2");
}

#[test]
fn adding_to_current_change_restores_records_on_failure() {
    let dir = tempdir().unwrap();
    let index = FailingIndex::containers(2);
    let engine = engine_over(&dir, index.clone());
    let (project, ws) = project_with_pending_merge(&engine);
    let scope = Scope::Container(project, ws);
    let before = index.get(scope, 0, path("a")).unwrap();

    index.arm();
    let batch = [(path("a"), b"a-replaced".to_vec()), (path("new"), b"new file".to_vec())];
    assert!(engine.write_files(project, ws, 0, &batch).is_err());

    assert_eq!(index.get(scope, 0, path("a")).unwrap(), before);
    assert_eq!(index.get(scope, 0, path("new")).unwrap(), None);
    assert_eq!(engine.regenerate_version(scope, 0, path("a")).unwrap(), b"a1");
    assert_eq!(engine.current_change(project, ws).unwrap(), Some(0));
}
