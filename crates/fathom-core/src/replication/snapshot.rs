//! Held-generations snapshot registry
//!
//! The snapshot-preserving deletion policy: a reference-counted registry of
//! pinned commit generations, consulted by the replication path and the
//! backup path. Acquire increments, release decrements, and a generation's
//! captured files are physically removed only once no holder references
//! them.
//!
//! A capture hard-links every replicable file of the commit point into
//! `snapshots/gen-<g>/`. Segment files are write-once and the engine swaps
//! its metadata file atomically, so the pinned inodes stay intact no matter
//! what background merges do to the live directory afterwards. Capturing
//! can lose a race against the engine's file garbage collection; the
//! capture is then discarded and retaken.

use crate::directory::{scan_files, IndexPaths};
use crate::replication::manifest::{FileEntry, Namespace, SnapshotManifest};
use crate::replication::{CAPTURE_RETRIES, ENGINE_META_FILE};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use uuid::Uuid;

struct GenerationHold {
    manifest: SnapshotManifest,
    refs: u32,
}

/// Registry of held snapshot generations for one index
pub struct SnapshotRegistry {
    master_uuid: Uuid,
    paths: IndexPaths,
    with_taxonomy: bool,
    holds: Mutex<HashMap<u64, GenerationHold>>,
}

impl SnapshotRegistry {
    /// Registry over the given index layout
    pub fn new(master_uuid: Uuid, paths: IndexPaths, with_taxonomy: bool) -> Self {
        Self {
            master_uuid,
            paths,
            with_taxonomy,
            holds: Mutex::new(HashMap::new()),
        }
    }

    fn generation_dir(&self, generation: u64) -> PathBuf {
        self.paths.snapshots.join(format!("gen-{generation}"))
    }

    /// Pin a generation, capturing its file set on first acquisition.
    ///
    /// Multiple holders of the same generation share one capture; each
    /// acquire must be paired with one release.
    pub fn acquire(&self, generation: u64) -> Result<SnapshotManifest> {
        let mut holds = self.holds.lock();
        if let Some(hold) = holds.get_mut(&generation) {
            hold.refs += 1;
            return Ok(hold.manifest.clone());
        }

        let manifest = self.capture(generation)?;
        holds.insert(
            generation,
            GenerationHold {
                manifest: manifest.clone(),
                refs: 1,
            },
        );
        tracing::info!(
            generation,
            files = manifest.file_count(),
            bytes = manifest.total_bytes(),
            "snapshot generation pinned"
        );
        Ok(manifest)
    }

    /// Drop one hold; the capture is deleted when the last hold goes
    pub fn release(&self, generation: u64) -> Result<()> {
        let mut holds = self.holds.lock();
        let hold = holds
            .get_mut(&generation)
            .ok_or_else(|| Error::not_found(format!("generation {generation} is not held")))?;
        hold.refs -= 1;
        if hold.refs == 0 {
            holds.remove(&generation);
            let dir = self.generation_dir(generation);
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(generation, error = %e, "failed to remove snapshot capture");
            }
            tracing::info!(generation, "snapshot generation released");
        }
        Ok(())
    }

    /// Generations currently held, with their reference counts
    pub fn held(&self) -> Vec<(u64, u32)> {
        self.holds
            .lock()
            .iter()
            .map(|(generation, hold)| (*generation, hold.refs))
            .collect()
    }

    /// Path of a captured file; the generation must be held
    pub fn captured_file(
        &self,
        generation: u64,
        namespace: Namespace,
        name: &str,
    ) -> Result<PathBuf> {
        let holds = self.holds.lock();
        let hold = holds
            .get(&generation)
            .ok_or_else(|| Error::not_found(format!("generation {generation} is not held")))?;
        if hold.manifest.file(namespace, name).is_none() {
            return Err(Error::not_found(format!(
                "file {name} is not part of generation {generation}"
            )));
        }
        Ok(self
            .generation_dir(generation)
            .join(namespace.dir_name())
            .join(name))
    }

    /// Byte-range read of a captured file
    pub fn read_chunk(
        &self,
        generation: u64,
        namespace: Namespace,
        name: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        let path = self.captured_file(generation, namespace, name)?;
        let mut file = File::open(&path)
            .map_err(|e| Error::replication(format!("cannot open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::replication(format!("seek failed: {e}")))?;
        let mut buf = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = file
                .read(&mut buf[read..])
                .map_err(|e| Error::replication(format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    /// Capture the commit point's files under the generation directory
    fn capture(&self, generation: u64) -> Result<SnapshotManifest> {
        let dir = self.generation_dir(generation);
        let mut last_error = None;

        for attempt in 0..CAPTURE_RETRIES {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            match self.try_capture(generation, &dir) {
                Ok(manifest) => return Ok(manifest),
                Err(e) => {
                    tracing::warn!(generation, attempt, error = %e, "snapshot capture retry");
                    last_error = Some(e);
                }
            }
        }

        let _ = fs::remove_dir_all(&dir);
        Err(last_error
            .unwrap_or_else(|| Error::internal("snapshot capture failed without error")))
    }

    fn try_capture(&self, generation: u64, dir: &PathBuf) -> Result<SnapshotManifest> {
        let mut files = Vec::new();
        self.capture_namespace(Namespace::Data, &dir.join("data"), &mut files)?;
        if self.with_taxonomy {
            self.capture_namespace(Namespace::Taxonomy, &dir.join("taxonomy"), &mut files)?;
        }
        Ok(SnapshotManifest {
            master_uuid: self.master_uuid,
            generation,
            files,
        })
    }

    fn capture_namespace(
        &self,
        namespace: Namespace,
        dst: &PathBuf,
        out: &mut Vec<FileEntry>,
    ) -> Result<()> {
        let live = self
            .paths
            .namespace_dir(namespace == Namespace::Taxonomy)
            .to_path_buf();
        fs::create_dir_all(dst)?;

        let mut names: Vec<String> = fs::read_dir(&live)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| crate::directory::is_replicable_file(name))
            .collect();
        // The metadata file defines the commit point; link it first so every
        // file it references is already complete on disk.
        names.sort_by_key(|name| (name != ENGINE_META_FILE, name.clone()));

        for name in &names {
            fs::hard_link(live.join(name), dst.join(name))?;
        }

        for file in scan_files(dst)? {
            out.push(FileEntry {
                namespace,
                name: file.name,
                size: file.size,
                checksum: file.checksum,
            });
        }
        Ok(())
    }
}
