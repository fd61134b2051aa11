// Project and container naming.
//
// Maps human names to the integer ids the stores are keyed by, pins
// each container's base commit at creation, and holds the published head
// of every project and container.  A commit or change exists once its
// head is set here; location records above a head are not part of it.
// `JsonCatalog` persists the whole table as one JSON document, replaced
// atomically on every change.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::{ChangeId, CommitId, ContainerId, ProjectId};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown project {0:?}")]
    UnknownProject(String),
    #[error("unknown container {container:?} in project {project}")]
    UnknownContainer { project: String, container: String },
    #[error("{0:?} already exists")]
    DuplicateName(String),
    #[error("catalog I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A container as recorded at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    /// Commit the container was branched from; `None` for an empty project.
    pub base_commit: Option<CommitId>,
    /// Latest published change; `None` until the first push.
    #[serde(default)]
    pub head_change: Option<ChangeId>,
}

/// Naming and metadata lookups consumed by the engine.
pub trait Catalog: Send + Sync {
    fn create_project(&self, name: &str) -> Result<ProjectId, CatalogError>;

    fn project_id(&self, name: &str) -> Result<ProjectId, CatalogError>;

    fn create_container(
        &self,
        project: ProjectId,
        name: &str,
        base_commit: Option<CommitId>,
    ) -> Result<ContainerId, CatalogError>;

    fn container_id(&self, project: ProjectId, name: &str) -> Result<ContainerId, CatalogError>;

    fn container(&self, project: ProjectId, container: ContainerId) -> Result<ContainerInfo, CatalogError>;

    fn containers(&self, project: ProjectId) -> Result<Vec<ContainerInfo>, CatalogError>;

    fn remove_container(&self, project: ProjectId, container: ContainerId) -> Result<(), CatalogError>;

    fn remove_project(&self, project: ProjectId) -> Result<(), CatalogError>;

    /// Latest published commit; `None` before the first merge.
    fn commit_head(&self, project: ProjectId) -> Result<Option<CommitId>, CatalogError>;

    /// Publish `commit` as the project's latest commit.
    fn set_commit_head(&self, project: ProjectId, commit: CommitId) -> Result<(), CatalogError>;

    /// Publish `change` as the container's latest change.
    fn set_change_head(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
    ) -> Result<(), CatalogError>;
}

// ---------------------------------------------------------------------------
// JsonCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectEntry {
    id: ProjectId,
    #[serde(default)]
    head_commit: Option<CommitId>,
    next_container: ContainerId,
    containers: BTreeMap<String, ContainerInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    next_project: ProjectId,
    projects: BTreeMap<String, ProjectEntry>,
}

impl CatalogState {
    fn project_mut(&mut self, id: ProjectId) -> Result<&mut ProjectEntry, CatalogError> {
        self.projects
            .values_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CatalogError::UnknownProject(id.to_string()))
    }

    fn project(&self, id: ProjectId) -> Result<&ProjectEntry, CatalogError> {
        self.projects
            .values()
            .find(|p| p.id == id)
            .ok_or_else(|| CatalogError::UnknownProject(id.to_string()))
    }

    fn container_mut(
        &mut self,
        project: ProjectId,
        container: ContainerId,
    ) -> Result<&mut ContainerInfo, CatalogError> {
        self.project_mut(project)?
            .containers
            .values_mut()
            .find(|c| c.id == container)
            .ok_or_else(|| CatalogError::UnknownContainer {
                project: project.to_string(),
                container: container.to_string(),
            })
    }
}

/// Catalog stored as a single JSON file, or kept in memory only.
pub struct JsonCatalog {
    path: Option<PathBuf>,
    state: Mutex<CatalogState>,
}

impl JsonCatalog {
    /// Open (or start) the catalog at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => CatalogState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Catalog that is never written to disk.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, state: &CatalogState) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, state)?;
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Catalog for JsonCatalog {
    fn create_project(&self, name: &str) -> Result<ProjectId, CatalogError> {
        let mut state = self.state.lock();
        if state.projects.contains_key(name) {
            return Err(CatalogError::DuplicateName(name.to_string()));
        }
        let id = state.next_project;
        state.next_project += 1;
        state.projects.insert(
            name.to_string(),
            ProjectEntry {
                id,
                ..ProjectEntry::default()
            },
        );
        self.persist(&state)?;
        Ok(id)
    }

    fn project_id(&self, name: &str) -> Result<ProjectId, CatalogError> {
        self.state
            .lock()
            .projects
            .get(name)
            .map(|p| p.id)
            .ok_or_else(|| CatalogError::UnknownProject(name.to_string()))
    }

    fn create_container(
        &self,
        project: ProjectId,
        name: &str,
        base_commit: Option<CommitId>,
    ) -> Result<ContainerId, CatalogError> {
        let mut state = self.state.lock();
        let entry = state.project_mut(project)?;
        if entry.containers.contains_key(name) {
            return Err(CatalogError::DuplicateName(name.to_string()));
        }
        let id = entry.next_container;
        entry.next_container += 1;
        entry.containers.insert(
            name.to_string(),
            ContainerInfo {
                id,
                name: name.to_string(),
                base_commit,
                head_change: None,
            },
        );
        self.persist(&state)?;
        Ok(id)
    }

    fn container_id(&self, project: ProjectId, name: &str) -> Result<ContainerId, CatalogError> {
        let state = self.state.lock();
        state
            .project(project)?
            .containers
            .get(name)
            .map(|c| c.id)
            .ok_or_else(|| CatalogError::UnknownContainer {
                project: project.to_string(),
                container: name.to_string(),
            })
    }

    fn container(&self, project: ProjectId, container: ContainerId) -> Result<ContainerInfo, CatalogError> {
        let state = self.state.lock();
        state
            .project(project)?
            .containers
            .values()
            .find(|c| c.id == container)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownContainer {
                project: project.to_string(),
                container: container.to_string(),
            })
    }

    fn containers(&self, project: ProjectId) -> Result<Vec<ContainerInfo>, CatalogError> {
        let state = self.state.lock();
        Ok(state.project(project)?.containers.values().cloned().collect())
    }

    fn remove_container(&self, project: ProjectId, container: ContainerId) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        state.project_mut(project)?.containers.retain(|_, c| c.id != container);
        self.persist(&state)
    }

    fn remove_project(&self, project: ProjectId) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        state.projects.retain(|_, p| p.id != project);
        self.persist(&state)
    }

    fn commit_head(&self, project: ProjectId) -> Result<Option<CommitId>, CatalogError> {
        Ok(self.state.lock().project(project)?.head_commit)
    }

    fn set_commit_head(&self, project: ProjectId, commit: CommitId) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let entry = state.project_mut(project)?;
        let previous = entry.head_commit.replace(commit);
        if let Err(e) = self.persist(&state) {
            state.project_mut(project)?.head_commit = previous;
            return Err(e);
        }
        Ok(())
    }

    fn set_change_head(
        &self,
        project: ProjectId,
        container: ContainerId,
        change: ChangeId,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let previous = state.container_mut(project, container)?.head_change.replace(change);
        if let Err(e) = self.persist(&state) {
            state.container_mut(project, container)?.head_change = previous;
            return Err(e);
        }
        Ok(())
    }
}
