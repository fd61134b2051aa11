// File manifests.
//
// A manifest maps logical paths to `{mod_time, is_dir, content_hash}`.
// It is versioned like any other file, stored as JSON under
// `MANIFEST_PATH`, so a commit's manifest tells a client which paths
// exist at that commit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{PathHash, content_digest};

/// Reserved logical path the manifest is stored under.
pub const MANIFEST_PATH: &str = ".chunksync/manifest";

pub fn manifest_path_hash() -> PathHash {
    PathHash::from_path(MANIFEST_PATH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Modification time in milliseconds since the Unix epoch.
    pub mod_time: u64,
    pub is_dir: bool,
    /// xxh3-128 of the file's bytes; zero for directories.
    #[serde(with = "hex")]
    pub content_hash: [u8; 16],
}

impl FileEntry {
    pub fn file(content: &[u8], mod_time: u64) -> Self {
        Self {
            mod_time,
            is_dir: false,
            content_hash: content_digest(content),
        }
    }

    pub fn dir(mod_time: u64) -> Self {
        Self {
            mod_time,
            is_dir: true,
            content_hash: [0; 16],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    files: BTreeMap<String, FileEntry>,
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) -> Option<FileEntry> {
        self.files.insert(path.into(), entry)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a stored manifest; empty bytes are an empty manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }

    /// Classify every path of `local` and `remote` from `local`'s point of view.
    ///
    /// Paths only in `remote` are `Delete`; only in `local` are `Create`;
    /// in both with differing entries are `Update`; identical are `NoOp`.
    pub fn diff(local: &FileMetadata, remote: &FileMetadata) -> FileMetadataDiff {
        let mut diffs: BTreeMap<String, FileDiff> = remote
            .files
            .keys()
            .map(|p| {
                (
                    p.clone(),
                    FileDiff {
                        kind: DiffKind::Delete,
                        entry: None,
                    },
                )
            })
            .collect();

        for (path, entry) in &local.files {
            let diff = match remote.files.get(path) {
                Some(r) if r == entry => FileDiff {
                    kind: DiffKind::NoOp,
                    entry: None,
                },
                Some(_) => FileDiff {
                    kind: DiffKind::Update,
                    entry: Some(*entry),
                },
                None => FileDiff {
                    kind: DiffKind::Create,
                    entry: Some(*entry),
                },
            };
            diffs.insert(path.clone(), diff);
        }
        FileMetadataDiff { diffs }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    Create,
    Update,
    Delete,
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub kind: DiffKind,
    /// New entry for `Create` and `Update`.
    pub entry: Option<FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataDiff {
    diffs: BTreeMap<String, FileDiff>,
}

impl FileMetadataDiff {
    pub fn get(&self, path: &str) -> Option<&FileDiff> {
        self.diffs.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileDiff)> {
        self.diffs.iter().map(|(p, d)| (p.as_str(), d))
    }

    pub fn has_changes(&self) -> bool {
        self.diffs.values().any(|d| d.kind != DiffKind::NoOp)
    }

    /// Non-directory paths whose content must be uploaded.
    pub fn uploads(&self) -> impl Iterator<Item = &str> {
        self.diffs
            .iter()
            .filter(|(_, d)| {
                matches!(d.kind, DiffKind::Create | DiffKind::Update)
                    && d.entry.is_some_and(|e| !e.is_dir)
            })
            .map(|(p, _)| p.as_str())
    }

    pub fn deletions(&self) -> impl Iterator<Item = &str> {
        self.diffs
            .iter()
            .filter(|(_, d)| d.kind == DiffKind::Delete)
            .map(|(p, _)| p.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_classifies_every_path() {
        let mut remote = FileMetadata::new();
        remote.insert("same.txt", FileEntry::file(b"a", 1));
        remote.insert("changed.txt", FileEntry::file(b"old", 1));
        remote.insert("gone.txt", FileEntry::file(b"x", 1));

        let mut local = FileMetadata::new();
        local.insert("same.txt", FileEntry::file(b"a", 1));
        local.insert("changed.txt", FileEntry::file(b"new", 2));
        local.insert("fresh.txt", FileEntry::file(b"y", 3));
        local.insert("dir", FileEntry::dir(3));

        let diff = FileMetadata::diff(&local, &remote);
        let kind = |p: &str| diff.get(p).map(|d| d.kind);
        assert_eq!(kind("same.txt"), Some(DiffKind::NoOp));
        assert_eq!(kind("changed.txt"), Some(DiffKind::Update));
        assert_eq!(kind("gone.txt"), Some(DiffKind::Delete));
        assert_eq!(kind("fresh.txt"), Some(DiffKind::Create));
        assert!(diff.has_changes());

        let uploads: Vec<&str> = diff.uploads().collect();
        assert_eq!(uploads, ["changed.txt", "fresh.txt"]);
        assert_eq!(diff.deletions().collect::<Vec<_>>(), ["gone.txt"]);
    }

    #[test]
    fn identical_manifests_have_no_changes() {
        let mut m = FileMetadata::new();
        m.insert("a", FileEntry::file(b"1", 5));
        assert!(!FileMetadata::diff(&m, &m.clone()).has_changes());
        assert!(!FileMetadata::diff(&FileMetadata::new(), &FileMetadata::new()).has_changes());
    }

    #[test]
    fn json_form_is_stable() {
        let mut m = FileMetadata::new();
        m.insert("b.txt", FileEntry::file(b"hello", 42));
        let bytes = m.to_json().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"b.txt\""));
        assert!(text.contains(&hex::encode(content_digest(b"hello"))));
        assert_eq!(FileMetadata::from_json(&bytes).unwrap(), m);
        assert!(FileMetadata::from_json(b"").unwrap().is_empty());
    }
}
