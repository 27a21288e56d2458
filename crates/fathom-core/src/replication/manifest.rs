//! Snapshot manifests and sync planning
//!
//! A manifest is the full file listing of one pinned generation: for every
//! file its namespace, name, byte length and CRC32. The slave computes a
//! sync plan as the set difference between the manifest and its local
//! files: matching files are kept untouched, missing or mismatched files
//! are fetched, local files absent from the manifest are deleted only
//! after the new set is in place.

use crate::directory::LocalFile;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Replicated namespace of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Primary document index
    Data,
    /// Secondary facet-label index
    Taxonomy,
}

impl Namespace {
    /// Directory name of the namespace inside captures and staging areas
    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Data => "data",
            Namespace::Taxonomy => "taxonomy",
        }
    }
}

/// One file of a snapshot manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Namespace the file belongs to
    pub namespace: Namespace,
    /// File name relative to the namespace directory
    pub name: String,
    /// Byte length
    pub size: u64,
    /// CRC32 over the content
    pub checksum: u32,
}

impl FileEntry {
    fn matches(&self, local: &LocalFile) -> bool {
        self.size == local.size && self.checksum == local.checksum
    }
}

/// Full file manifest of one pinned generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Identity of the master that produced the snapshot
    pub master_uuid: Uuid,
    /// Commit generation the snapshot pins
    pub generation: u64,
    /// Every file of the generation
    pub files: Vec<FileEntry>,
}

impl SnapshotManifest {
    /// Total payload size of the manifest
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Number of files in the manifest
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Look up a manifest file
    pub fn file(&self, namespace: Namespace, name: &str) -> Option<&FileEntry> {
        self.files
            .iter()
            .find(|f| f.namespace == namespace && f.name == name)
    }

    /// Compute the sync plan against the locally held files
    pub fn diff(&self, local: &[(Namespace, LocalFile)]) -> SyncPlan {
        let fetch = self
            .files
            .iter()
            .filter(|entry| {
                !local.iter().any(|(ns, file)| {
                    *ns == entry.namespace && file.name == entry.name && entry.matches(file)
                })
            })
            .cloned()
            .collect();

        let delete = local
            .iter()
            .filter(|(ns, file)| self.file(*ns, &file.name).is_none())
            .map(|(ns, file)| (*ns, file.name.clone()))
            .collect();

        SyncPlan { fetch, delete }
    }
}

/// Work a sync cycle has to do
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Files to download into staging
    pub fetch: Vec<FileEntry>,
    /// Local files to delete once the new set is in place
    pub delete: Vec<(Namespace, String)>,
}

impl SyncPlan {
    /// True when the local file set already matches the manifest
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.delete.is_empty()
    }

    /// Bytes the plan will download
    pub fn fetch_bytes(&self) -> u64 {
        self.fetch.iter().map(|f| f.size).sum()
    }
}
