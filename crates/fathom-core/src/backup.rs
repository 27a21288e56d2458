//! Backup manager
//!
//! Reuses the held-generations snapshot mechanism to produce durable,
//! retained, timestamped backups: pin the current generation, copy every
//! manifest file into a new backup directory, record size and file count,
//! release the pin. Entries are ordered newest first and pruned oldest
//! first.

use crate::replication::manifest::{Namespace, SnapshotManifest};
use crate::replication::snapshot::SnapshotRegistry;
use crate::directory::IndexPaths;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Name of the record file inside each backup directory
const BACKUP_RECORD_FILE: &str = "backup.json";

/// One retained backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// Creation time, UTC milliseconds; also the directory name
    pub created_at: u64,
    /// Total payload bytes
    pub bytes: u64,
    /// Number of files
    pub file_count: usize,
    /// Backup directory
    pub location: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupRecord {
    created_at: u64,
    bytes: u64,
    file_count: usize,
    manifest: SnapshotManifest,
}

/// Backup manager for one master index
pub struct BackupManager {
    backup_root: PathBuf,
    registry: Arc<SnapshotRegistry>,
    generation: Arc<AtomicU64>,
}

impl BackupManager {
    /// Manager writing entries under `backup_root`
    pub fn new(
        backup_root: PathBuf,
        registry: Arc<SnapshotRegistry>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            backup_root,
            registry,
            generation,
        }
    }

    /// Create a new backup of the current committed state.
    ///
    /// Two successive backups with no intervening writes yield distinct
    /// entries with identical content.
    pub fn create_backup(&self) -> Result<BackupEntry> {
        let generation = self.generation.load(Ordering::SeqCst);
        let manifest = self.registry.acquire(generation)?;

        let result = self.copy_capture(&manifest);

        if let Err(e) = self.registry.release(generation) {
            tracing::warn!(generation, error = %e, "failed to release backup snapshot");
        }

        let entry = result?;
        tracing::info!(
            generation,
            created_at = entry.created_at,
            bytes = entry.bytes,
            files = entry.file_count,
            "backup created"
        );
        Ok(entry)
    }

    fn copy_capture(&self, manifest: &SnapshotManifest) -> Result<BackupEntry> {
        fs::create_dir_all(&self.backup_root)?;

        // Timestamped directory name; bump on collision so rapid successive
        // backups stay distinct entries
        let mut created_at = chrono::Utc::now().timestamp_millis() as u64;
        let mut backup_dir = self.backup_root.join(created_at.to_string());
        while backup_dir.exists() {
            created_at += 1;
            backup_dir = self.backup_root.join(created_at.to_string());
        }

        let copy = || -> Result<()> {
            for file in &manifest.files {
                let src = self.registry.captured_file(
                    manifest.generation,
                    file.namespace,
                    &file.name,
                )?;
                let dst_dir = backup_dir.join(file.namespace.dir_name());
                fs::create_dir_all(&dst_dir)?;
                fs::copy(&src, dst_dir.join(&file.name))?;
            }
            let record = BackupRecord {
                created_at,
                bytes: manifest.total_bytes(),
                file_count: manifest.file_count(),
                manifest: manifest.clone(),
            };
            let raw = serde_json::to_string_pretty(&record)
                .map_err(|e| Error::internal(format!("backup record serialization: {e}")))?;
            fs::write(backup_dir.join(BACKUP_RECORD_FILE), raw)?;
            Ok(())
        };

        if let Err(e) = copy() {
            // A half-written backup directory is worse than no backup
            let _ = fs::remove_dir_all(&backup_dir);
            return Err(e);
        }

        Ok(BackupEntry {
            created_at,
            bytes: manifest.total_bytes(),
            file_count: manifest.file_count(),
            location: backup_dir,
        })
    }

    /// All retained backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        if !self.backup_root.exists() {
            return Ok(entries);
        }
        for dir_entry in fs::read_dir(&self.backup_root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.path().is_dir() {
                continue;
            }
            match self.read_record(&dir_entry.path()) {
                Ok(record) => entries.push(BackupEntry {
                    created_at: record.created_at,
                    bytes: record.bytes,
                    file_count: record.file_count,
                    location: dir_entry.path(),
                }),
                Err(e) => {
                    tracing::warn!(path = %dir_entry.path().display(), error = %e,
                        "skipping unreadable backup entry");
                }
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    /// Delete all but the `keep` most recent entries; a `keep` at or above
    /// the current count is a no-op. Returns the number removed.
    pub fn purge_backups(&self, keep: usize) -> Result<usize> {
        let entries = self.list_backups()?;
        if entries.len() <= keep {
            return Ok(0);
        }
        let stale = &entries[keep..];
        for entry in stale {
            fs::remove_dir_all(&entry.location)?;
            tracing::info!(created_at = entry.created_at, "backup purged");
        }
        Ok(stale.len())
    }

    /// Copy a backup's file set into a fresh index layout, byte-identical
    /// to the manifest captured at backup time
    pub fn restore(&self, created_at: u64, target: &IndexPaths) -> Result<()> {
        let backup_dir = self.backup_root.join(created_at.to_string());
        let record = self.read_record(&backup_dir)?;
        let with_taxonomy = record
            .manifest
            .files
            .iter()
            .any(|f| f.namespace == Namespace::Taxonomy);
        target.ensure(with_taxonomy)?;

        for file in &record.manifest.files {
            let src = backup_dir.join(file.namespace.dir_name()).join(&file.name);
            let dst_dir = target.namespace_dir(file.namespace == Namespace::Taxonomy);
            fs::copy(&src, dst_dir.join(&file.name))?;
        }
        Ok(())
    }

    fn read_record(&self, backup_dir: &Path) -> Result<BackupRecord> {
        let raw = fs::read_to_string(backup_dir.join(BACKUP_RECORD_FILE)).map_err(|e| {
            Error::not_found(format!(
                "backup record missing in {}: {e}",
                backup_dir.display()
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::corruption(format!("invalid backup record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn manager_with_files(files: &[(&str, &[u8])]) -> (TempDir, BackupManager) {
        let dir = TempDir::new().unwrap();
        let paths = IndexPaths::at(dir.path().join("index"));
        paths.ensure(false).unwrap();
        for (name, content) in files {
            fs::write(paths.data.join(name), content).unwrap();
        }
        let backups = paths.backups.clone();
        let registry = Arc::new(SnapshotRegistry::new(Uuid::new_v4(), paths, false));
        let manager = BackupManager::new(backups, registry, Arc::new(AtomicU64::new(2)));
        (dir, manager)
    }

    #[test]
    fn test_create_and_list() {
        let (_dir, manager) = manager_with_files(&[("meta.json", b"{}"), ("seg.store", b"bytes")]);
        assert!(manager.list_backups().unwrap().is_empty());

        let entry = manager.create_backup().unwrap();
        assert_eq!(entry.file_count, 2);
        assert_eq!(entry.bytes, 7);

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed, vec![entry]);
    }

    #[test]
    fn test_successive_backups_are_distinct_but_content_equal() {
        let (_dir, manager) = manager_with_files(&[("meta.json", b"{}")]);
        let first = manager.create_backup().unwrap();
        let second = manager.create_backup().unwrap();

        assert_ne!(first.created_at, second.created_at);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.file_count, second.file_count);

        // Newest first
        let listed = manager.list_backups().unwrap();
        assert_eq!(listed[0], second);
        assert_eq!(listed[1], first);
    }

    #[test]
    fn test_purge_keeps_most_recent() {
        let (_dir, manager) = manager_with_files(&[("meta.json", b"{}")]);
        let oldest = manager.create_backup().unwrap();
        let middle = manager.create_backup().unwrap();
        let newest = manager.create_backup().unwrap();

        let removed = manager.purge_backups(2).unwrap();
        assert_eq!(removed, 1);
        assert!(!oldest.location.exists());

        let remaining = manager.list_backups().unwrap();
        assert_eq!(remaining, vec![newest, middle]);
    }

    #[test]
    fn test_purge_at_or_above_count_is_noop() {
        let (_dir, manager) = manager_with_files(&[("meta.json", b"{}")]);
        manager.create_backup().unwrap();
        assert_eq!(manager.purge_backups(1).unwrap(), 0);
        assert_eq!(manager.purge_backups(5).unwrap(), 0);
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_round_trip() {
        let (dir, manager) = manager_with_files(&[("meta.json", b"{}"), ("seg.store", b"bytes")]);
        let entry = manager.create_backup().unwrap();

        let target = IndexPaths::at(dir.path().join("restored"));
        manager.restore(entry.created_at, &target).unwrap();

        assert_eq!(fs::read(target.data.join("meta.json")).unwrap(), b"{}");
        assert_eq!(fs::read(target.data.join("seg.store")).unwrap(), b"bytes");
    }

    #[test]
    fn test_snapshot_released_after_backup() {
        let (_dir, manager) = manager_with_files(&[("meta.json", b"{}")]);
        manager.create_backup().unwrap();
        assert!(manager.registry.held().is_empty());
    }
}
