// On-disk path scheme.
//
//   <root>/<project>/opdata/commit/<PP>/<HASH>.ops
//   <root>/<project>/opdata/container/<cid>/<PP>/<HASH>.ops
//   <root>/<project>/oplocs/commit/<commit>/<PP>/<HASH>.locs
//   <root>/<project>/oplocs/container/<cid>/<change>/<PP>/<HASH>.locs
//
// `PP` is the first byte of the path hash in hex, which caps every
// directory at 256 shard entries.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::{ProjectId, Scope};
use crate::hash::PathHash;

const DATA_EXT: &str = "ops";
const LOC_EXT: &str = "locs";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: ProjectId) -> PathBuf {
        self.root.join(project.to_string())
    }

    /// Directory holding every data log of `scope`.
    pub fn data_dir(&self, scope: Scope) -> PathBuf {
        let base = self.project_dir(scope.project()).join("opdata");
        match scope {
            Scope::Commit(_) => base.join("commit"),
            Scope::Container(_, c) => base.join("container").join(c.to_string()),
        }
    }

    pub fn data_log(&self, scope: Scope, path: PathHash) -> PathBuf {
        shard(self.data_dir(scope), path, DATA_EXT)
    }

    /// Directory holding every location record of `scope`, one subdirectory per version.
    pub fn loc_dir(&self, scope: Scope) -> PathBuf {
        let base = self.project_dir(scope.project()).join("oplocs");
        match scope {
            Scope::Commit(_) => base.join("commit"),
            Scope::Container(_, c) => base.join("container").join(c.to_string()),
        }
    }

    pub fn loc_version_dir(&self, scope: Scope, version: u64) -> PathBuf {
        self.loc_dir(scope).join(version.to_string())
    }

    pub fn loc_record(&self, scope: Scope, version: u64, path: PathHash) -> PathBuf {
        shard(self.loc_version_dir(scope, version), path, LOC_EXT)
    }
}

fn shard(dir: PathBuf, path: PathHash, ext: &str) -> PathBuf {
    dir.join(format!("{:02X}", path.prefix()))
        .join(format!("{}.{ext}", path.to_hex()))
}

/// Path hash named by a data log file, if `name` is one.
pub fn parse_data_log(name: &OsStr) -> Option<PathHash> {
    parse_named(name, DATA_EXT)
}

/// Path hash named by a location record file, if `name` is one.
pub fn parse_loc_record(name: &OsStr) -> Option<PathHash> {
    parse_named(name, LOC_EXT)
}

/// Version number named by a directory, if `name` is one.
pub fn parse_version(name: &OsStr) -> Option<u64> {
    let s = name.to_str()?;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_named(name: &OsStr, ext: &str) -> Option<PathHash> {
    let stem = name.to_str()?.strip_suffix(ext)?.strip_suffix('.')?;
    stem.parse().ok()
}
