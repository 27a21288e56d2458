//! Slave side of the replication protocol
//!
//! Runs the sync cycle: identity check, manifest fetch, three-way diff,
//! chunked downloads into the staging area, atomic promotion, deferred
//! deletion, snapshot release, reader refresh. Any step failing aborts the
//! cycle, leaves the prior local state fully intact and queryable, and the
//! next cycle retries from the top. Partial downloads are discarded, never
//! promoted.

use crate::directory::{
    file_checksum, is_replicable_file, scan_files, IndexPaths, LocalFile, StagedWriter, WriteCache,
};
use crate::metadata::IndexMetadata;
use crate::pair::WriterAndSearcher;
use crate::replication::manifest::{FileEntry, Namespace, SyncPlan};
use crate::replication::{
    MasterEndpoint, MasterLocator, ReplicationLag, CHUNK_RETRIES, ENGINE_META_FILE, FILE_RETRIES,
    TRANSFER_CHUNK_SIZE,
};
use crate::settings::RemoteName;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Delay between retries of a failed chunk
const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Outcome of one successful sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Generation the slave now holds
    pub generation: u64,
    /// Whether the cycle discarded all local files first
    pub full_sync: bool,
    /// Files downloaded
    pub files_fetched: usize,
    /// Bytes downloaded
    pub bytes_fetched: u64,
    /// Superseded local files deleted
    pub files_deleted: usize,
    /// False when the local set already matched the manifest
    pub changed: bool,
}

/// Slave-side replication statistics
#[derive(Debug, Clone, Default)]
pub struct SlaveStats {
    /// Completed sync cycles
    pub cycles: u64,
    /// Cycles aborted by an error
    pub failed_cycles: u64,
    /// Cycles that discarded all local files first
    pub full_syncs: u64,
    /// Total files downloaded
    pub files_fetched: u64,
    /// Total bytes downloaded
    pub bytes_fetched: u64,
}

struct SyncState {
    last_generation: u64,
    master_uuid: Option<Uuid>,
    master_generation: u64,
}

/// Replication slave endpoint for one index
pub struct ReplicationSlave {
    paths: IndexPaths,
    remote: RemoteName,
    locator: Arc<dyn MasterLocator>,
    with_taxonomy: bool,
    cache: Option<WriteCache>,
    state: Mutex<SyncState>,
    stats: Mutex<SlaveStats>,
}

/// Releases the master snapshot hold on every exit path of a cycle
struct SnapshotReleaseGuard {
    endpoint: Arc<dyn MasterEndpoint>,
    generation: u64,
}

impl Drop for SnapshotReleaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.endpoint.release_snapshot(self.generation) {
            tracing::warn!(generation = self.generation, error = %e,
                "failed to release master snapshot");
        }
    }
}

impl ReplicationSlave {
    /// Slave over the given index layout, pulling from `remote`.
    ///
    /// The last-seen master identity is restored from the metadata record
    /// so a restart does not silently accept a replaced master.
    pub fn new(
        paths: IndexPaths,
        remote: RemoteName,
        locator: Arc<dyn MasterLocator>,
        with_taxonomy: bool,
        cache: Option<WriteCache>,
    ) -> Self {
        let last_master_uuid = IndexMetadata::load(&paths.metadata)
            .ok()
            .flatten()
            .and_then(|m| m.last_master_uuid);
        Self {
            paths,
            remote,
            locator,
            with_taxonomy,
            cache,
            state: Mutex::new(SyncState {
                last_generation: 0,
                master_uuid: last_master_uuid,
                master_generation: 0,
            }),
            stats: Mutex::new(SlaveStats::default()),
        }
    }

    /// The configured remote master
    pub fn remote(&self) -> &RemoteName {
        &self.remote
    }

    /// Current replication lag
    pub fn lag(&self) -> ReplicationLag {
        let state = self.state.lock();
        ReplicationLag {
            local_generation: state.last_generation,
            master_generation: state.master_generation,
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SlaveStats {
        self.stats.lock().clone()
    }

    /// Run one sync cycle. Cycles are serialized; a concurrent caller
    /// blocks until the in-flight cycle finishes.
    pub fn sync(&self, pair: &WriterAndSearcher) -> Result<SyncReport> {
        let mut state = self.state.lock();
        match self.sync_cycle(&mut state, pair) {
            Ok(report) => {
                let mut stats = self.stats.lock();
                stats.cycles += 1;
                stats.files_fetched += report.files_fetched as u64;
                stats.bytes_fetched += report.bytes_fetched;
                if report.full_sync {
                    stats.full_syncs += 1;
                }
                Ok(report)
            }
            Err(e) => {
                self.stats.lock().failed_cycles += 1;
                tracing::warn!(error = %e, "sync cycle aborted; local state unchanged");
                Err(e)
            }
        }
    }

    fn sync_cycle(&self, state: &mut SyncState, pair: &WriterAndSearcher) -> Result<SyncReport> {
        let endpoint = self
            .locator
            .locate(&self.remote)
            .map_err(|e| Error::replication(format!("master unreachable: {e}")))?;

        let master_uuid = endpoint.master_uuid()?;
        let mut full_sync = false;
        if let Some(seen) = state.master_uuid {
            if seen != master_uuid {
                tracing::warn!(expected = %seen, actual = %master_uuid,
                    "master identity changed; discarding local files for full resync");
                self.discard_local_files()?;
                full_sync = true;
            }
        }

        let manifest = endpoint.new_snapshot()?;
        let generation = manifest.generation;
        state.master_generation = generation;
        let release_guard = SnapshotReleaseGuard {
            endpoint: endpoint.clone(),
            generation,
        };

        let local = self.scan_local()?;
        let plan = manifest.diff(&local);
        let changed = !plan.is_empty();
        let report = SyncReport {
            generation,
            full_sync,
            files_fetched: plan.fetch.len(),
            bytes_fetched: plan.fetch_bytes(),
            files_deleted: plan.delete.len(),
            changed,
        };

        // Leftovers from an aborted cycle are never promoted
        self.clear_staging()?;

        let mut staged: Vec<(FileEntry, PathBuf)> = Vec::with_capacity(plan.fetch.len());
        for entry in &plan.fetch {
            let path = self.download(endpoint.as_ref(), generation, entry)?;
            staged.push((entry.clone(), path));
        }

        self.promote(staged)?;
        self.delete_superseded(&plan)?;

        // Step 5 ends here: the new set is live, the hold can go
        drop(release_guard);

        pair.refresh()?;
        pair.set_generation(generation);

        state.last_generation = generation;
        state.master_uuid = Some(master_uuid);
        self.persist_master_uuid(master_uuid)?;
        self.clear_staging()?;

        tracing::info!(
            generation,
            files = report.files_fetched,
            bytes = report.bytes_fetched,
            deleted = report.files_deleted,
            full_sync,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Move staged files into the live namespaces; the engine metadata file
    /// of each namespace goes last so the commit point flips only once all
    /// files it references are in place
    fn promote(&self, mut staged: Vec<(FileEntry, PathBuf)>) -> Result<()> {
        staged.sort_by_key(|(entry, _)| entry.name == ENGINE_META_FILE);
        for (entry, path) in staged {
            let live_dir = self
                .paths
                .namespace_dir(entry.namespace == Namespace::Taxonomy);
            fs::create_dir_all(live_dir)?;
            fs::rename(&path, live_dir.join(&entry.name))?;
        }
        Ok(())
    }

    fn delete_superseded(&self, plan: &SyncPlan) -> Result<()> {
        for (namespace, name) in &plan.delete {
            let path = self
                .paths
                .namespace_dir(*namespace == Namespace::Taxonomy)
                .join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Download one manifest file into staging, verifying its checksum.
    /// A mismatch re-downloads the file; a persisting mismatch surfaces as
    /// corruption.
    fn download(
        &self,
        endpoint: &dyn MasterEndpoint,
        generation: u64,
        entry: &FileEntry,
    ) -> Result<PathBuf> {
        let staged_path = self
            .paths
            .staging
            .join(entry.namespace.dir_name())
            .join(&entry.name);

        for attempt in 0..FILE_RETRIES {
            self.download_once(endpoint, generation, entry, &staged_path)?;
            let checksum = file_checksum(&staged_path)?;
            if checksum == entry.checksum {
                return Ok(staged_path);
            }
            tracing::warn!(
                file = %entry.name,
                attempt,
                expected = entry.checksum,
                actual = checksum,
                "staged file checksum mismatch"
            );
            let _ = fs::remove_file(&staged_path);
        }

        Err(Error::corruption(format!(
            "checksum mismatch for {} persisted across {FILE_RETRIES} downloads",
            entry.name
        )))
    }

    fn download_once(
        &self,
        endpoint: &dyn MasterEndpoint,
        generation: u64,
        entry: &FileEntry,
        staged_path: &PathBuf,
    ) -> Result<()> {
        let mut writer = StagedWriter::create(staged_path, entry.size, self.cache.as_ref())?;
        let mut offset = 0u64;
        while offset < entry.size {
            let want = TRANSFER_CHUNK_SIZE.min((entry.size - offset) as usize);
            let chunk = self.fetch_chunk(endpoint, generation, entry, offset, want)?;
            if chunk.is_empty() {
                return Err(Error::replication(format!(
                    "unexpected end of file at offset {offset} of {}",
                    entry.name
                )));
            }
            writer.write_chunk(&chunk)?;
            offset += chunk.len() as u64;
        }
        writer.finish()
    }

    /// Fetch one chunk, retrying transient failures so a failing chunk does
    /// not restart the whole file
    fn fetch_chunk(
        &self,
        endpoint: &dyn MasterEndpoint,
        generation: u64,
        entry: &FileEntry,
        offset: u64,
        want: usize,
    ) -> Result<bytes::Bytes> {
        let mut last_error = None;
        for attempt in 0..CHUNK_RETRIES {
            match endpoint.read_file(generation, entry.namespace, &entry.name, offset, want) {
                Ok(chunk) => return Ok(chunk),
                Err(e) if e.is_transient() && attempt + 1 < CHUNK_RETRIES => {
                    tracing::debug!(file = %entry.name, offset, attempt, error = %e,
                        "chunk read retry");
                    last_error = Some(e);
                    std::thread::sleep(CHUNK_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::replication("chunk download failed")))
    }

    fn scan_local(&self) -> Result<Vec<(Namespace, LocalFile)>> {
        let mut local = Vec::new();
        for file in scan_files(&self.paths.data)? {
            local.push((Namespace::Data, file));
        }
        if self.with_taxonomy {
            for file in scan_files(&self.paths.taxonomy)? {
                local.push((Namespace::Taxonomy, file));
            }
        }
        Ok(local)
    }

    /// Remove every replicable local file, as if the index had never been
    /// synced
    fn discard_local_files(&self) -> Result<()> {
        for taxonomy in [false, true] {
            if taxonomy && !self.with_taxonomy {
                continue;
            }
            let dir = self.paths.namespace_dir(taxonomy);
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_file() && is_replicable_file(&name) {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn clear_staging(&self) -> Result<()> {
        match fs::remove_dir_all(&self.paths.staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist_master_uuid(&self, master_uuid: Uuid) -> Result<()> {
        if let Some(mut metadata) = IndexMetadata::load(&self.paths.metadata)? {
            if metadata.last_master_uuid != Some(master_uuid) {
                metadata.last_master_uuid = Some(master_uuid);
                metadata.store(&self.paths.metadata)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::master::ReplicationMaster;
    use crate::replication::snapshot::SnapshotRegistry;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    struct StaticLocator(Arc<ReplicationMaster>);

    impl MasterLocator for StaticLocator {
        fn locate(&self, _remote: &RemoteName) -> Result<Arc<dyn MasterEndpoint>> {
            Ok(self.0.clone())
        }
    }

    struct UnreachableLocator;

    impl MasterLocator for UnreachableLocator {
        fn locate(&self, remote: &RemoteName) -> Result<Arc<dyn MasterEndpoint>> {
            Err(Error::not_found(format!("no such master: {remote:?}")))
        }
    }

    fn master_fixture(files: &[(&str, &[u8])]) -> (TempDir, Arc<ReplicationMaster>) {
        let dir = TempDir::new().unwrap();
        let paths = IndexPaths::at(dir.path());
        paths.ensure(false).unwrap();
        for (name, content) in files {
            fs::write(paths.data.join(name), content).unwrap();
        }
        let uuid = Uuid::new_v4();
        let registry = Arc::new(SnapshotRegistry::new(uuid, paths, false));
        let master = Arc::new(ReplicationMaster::new(
            uuid,
            Arc::new(AtomicU64::new(1)),
            Some(registry),
        ));
        (dir, master)
    }

    fn slave_fixture(master: Arc<ReplicationMaster>) -> (TempDir, ReplicationSlave) {
        let dir = TempDir::new().unwrap();
        let paths = IndexPaths::at(dir.path());
        paths.ensure(false).unwrap();
        IndexMetadata::create(crate::settings::IndexRole::Slave)
            .store(&paths.metadata)
            .unwrap();
        let slave = ReplicationSlave::new(
            paths,
            RemoteName::of("tenants", "products"),
            Arc::new(StaticLocator(master)),
            false,
            None,
        );
        (dir, slave)
    }

    fn scratch_pair() -> WriterAndSearcher {
        let resolved = crate::mapping::FieldMapping::new()
            .field("title", crate::mapping::FieldKind::text())
            .resolve()
            .unwrap();
        let index = tantivy::Index::create_in_ram(resolved.schema);
        WriterAndSearcher::with_index(index, None, Arc::new(AtomicU64::new(0))).unwrap()
    }

    #[test]
    fn test_sync_copies_master_files() {
        let (_mdir, master) = master_fixture(&[("meta.json", b"{}"), ("seg.store", b"payload")]);
        let (sdir, slave) = slave_fixture(master.clone());
        let pair = scratch_pair();

        let report = slave.sync(&pair).unwrap();
        assert!(report.changed);
        assert_eq!(report.files_fetched, 2);
        assert_eq!(report.generation, 1);

        let copied = fs::read(sdir.path().join("data").join("seg.store")).unwrap();
        assert_eq!(copied, b"payload");
        // Snapshot hold released after the cycle
        assert!(master.held_generations().is_empty());
    }

    #[test]
    fn test_second_sync_is_idempotent() {
        let (_mdir, master) = master_fixture(&[("meta.json", b"{}"), ("seg.store", b"payload")]);
        let (_sdir, slave) = slave_fixture(master);
        let pair = scratch_pair();

        let first = slave.sync(&pair).unwrap();
        assert!(first.changed);

        let second = slave.sync(&pair).unwrap();
        assert!(!second.changed);
        assert_eq!(second.files_fetched, 0);
        assert_eq!(second.generation, first.generation);
        assert_eq!(slave.lag().behind(), 0);
    }

    #[test]
    fn test_stale_files_deleted_after_promotion() {
        let (_mdir, master) = master_fixture(&[("meta.json", b"{}"), ("new.store", b"new")]);
        let (sdir, slave) = slave_fixture(master);
        fs::write(sdir.path().join("data").join("old.store"), b"old").unwrap();
        let pair = scratch_pair();

        let report = slave.sync(&pair).unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(!sdir.path().join("data").join("old.store").exists());
        assert!(sdir.path().join("data").join("new.store").exists());
    }

    #[test]
    fn test_unreachable_master_is_transient() {
        let dir = TempDir::new().unwrap();
        let paths = IndexPaths::at(dir.path());
        paths.ensure(false).unwrap();
        let slave = ReplicationSlave::new(
            paths,
            RemoteName::of("tenants", "products"),
            Arc::new(UnreachableLocator),
            false,
            None,
        );
        let pair = scratch_pair();

        let err = slave.sync(&pair).unwrap_err();
        assert!(matches!(err, Error::TransientReplication(_)));
        assert_eq!(slave.stats().failed_cycles, 1);
    }

    #[test]
    fn test_master_identity_change_forces_full_resync() {
        let (_mdir_a, master_a) = master_fixture(&[("meta.json", b"{}"), ("a.store", b"aaa")]);
        let (sdir, slave) = slave_fixture(master_a.clone());
        let pair = scratch_pair();
        slave.sync(&pair).unwrap();
        assert!(sdir.path().join("data").join("a.store").exists());
        drop(slave);

        // Replace the master wholesale: new uuid, different file set. The
        // reconstructed slave restores the last-seen identity from its
        // metadata record and must refuse an incremental sync.
        let (_mdir_b, master_b) = master_fixture(&[("meta.json", b"{}"), ("b.store", b"bbb")]);
        let slave = ReplicationSlave::new(
            IndexPaths::at(sdir.path()),
            RemoteName::of("tenants", "products"),
            Arc::new(StaticLocator(master_b)),
            false,
            None,
        );

        let report = slave.sync(&pair).unwrap();
        assert!(report.full_sync);
        assert!(!sdir.path().join("data").join("a.store").exists());
        assert!(sdir.path().join("data").join("b.store").exists());
    }
}
