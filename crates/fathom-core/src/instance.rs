//! Index instance
//!
//! The unit of operation: one logical index with its UUID, settings,
//! directories, writer/searcher pair and replication endpoint. Every
//! document and query operation routes through the concurrency gate;
//! steady-state operational failures (replication, backup) are isolated
//! per operation and never take the instance down.

use crate::backup::{BackupEntry, BackupManager};
use crate::directory::{DirLock, IndexPaths};
use crate::document::Document;
use crate::gate::ReadWriteGate;
use crate::mapping::ResolvedMapping;
use crate::metadata::IndexMetadata;
use crate::pair::{SearcherLease, WriterAndSearcher};
use crate::query::{SearchHit, SearchQuery, SearchResults};
use crate::replication::master::ReplicationMaster;
use crate::replication::slave::{ReplicationSlave, SyncReport};
use crate::replication::ReplicationLag;
use crate::settings::{IndexRole, IndexSettings};
use crate::{Error, Result};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tantivy::collector::{Count, TopDocs};
use tantivy::schema::Value;
use tantivy::{TantivyDocument, Term};
use uuid::Uuid;

/// Role-specific endpoint owned by an instance
pub enum RoleEndpoint {
    /// Writable master with its snapshot-serving endpoint and backups
    Master {
        /// Replication endpoint served to slaves
        master: Arc<ReplicationMaster>,
        /// Backup manager; absent for in-memory indexes
        backup: Option<BackupManager>,
    },
    /// Read-only slave pulling from a remote master
    Slave {
        /// The sync endpoint
        slave: ReplicationSlave,
    },
}

/// Point-in-time status of an instance
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    /// Logical name
    pub name: String,
    /// Stable UUID
    pub uuid: Uuid,
    /// Replication role
    pub role: IndexRole,
    /// Last committed generation
    pub generation: u64,
    /// Documents visible to new searcher leases
    pub num_docs: u64,
    /// Snapshot generations currently pinned (master only)
    pub held_snapshots: usize,
}

struct SyncWorker {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// A live index
pub struct IndexInstance {
    name: String,
    metadata: IndexMetadata,
    settings: IndexSettings,
    paths: IndexPaths,
    mapping: ResolvedMapping,
    gate: Arc<ReadWriteGate>,
    pair: WriterAndSearcher,
    role: RoleEndpoint,
    generation: Arc<AtomicU64>,
    sync_worker: Mutex<Option<SyncWorker>>,
    _lock: Option<DirLock>,
}

impl std::fmt::Debug for IndexInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexInstance")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl IndexInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        name: String,
        metadata: IndexMetadata,
        settings: IndexSettings,
        paths: IndexPaths,
        mapping: ResolvedMapping,
        gate: Arc<ReadWriteGate>,
        pair: WriterAndSearcher,
        role: RoleEndpoint,
        generation: Arc<AtomicU64>,
        lock: Option<DirLock>,
    ) -> Self {
        Self {
            name,
            metadata,
            settings,
            paths,
            mapping,
            gate,
            pair,
            role,
            generation,
            sync_worker: Mutex::new(None),
            _lock: lock,
        }
    }

    /// Logical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable UUID
    pub fn uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    /// Replication role
    pub fn role(&self) -> IndexRole {
        self.metadata.role
    }

    /// The settings the instance was built from
    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// On-disk layout
    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    /// True when no local writer is held
    pub fn is_read_only(&self) -> bool {
        self.pair.is_read_only()
    }

    /// True when the index carries the taxonomy namespace
    pub fn has_taxonomy(&self) -> bool {
        self.pair.taxonomy().is_some()
    }

    /// Last committed generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // ---- document mutations (write permit) --------------------------------

    /// Add or replace documents by id. Changes become visible on the next
    /// [`commit`](Self::commit).
    pub fn post_documents(&self, documents: &[Document]) -> Result<usize> {
        let _permit = self
            .gate
            .acquire_write(self.uuid(), self.settings.write_timeout())?;
        for document in documents {
            let (engine_doc, facet_paths) = document.to_engine(&self.mapping)?;
            if let Some(taxonomy) = self.pair.taxonomy() {
                for path in &facet_paths {
                    taxonomy.register(path)?;
                }
            }
            self.pair.with_writer(|writer| {
                writer.delete_term(Term::from_field_text(self.mapping.id_field, &document.id));
                writer.add_document(engine_doc)?;
                Ok(())
            })?;
        }
        Ok(documents.len())
    }

    /// Delete documents by id
    pub fn delete_documents(&self, ids: &[String]) -> Result<()> {
        let _permit = self
            .gate
            .acquire_write(self.uuid(), self.settings.write_timeout())?;
        self.pair.with_writer(|writer| {
            for id in ids {
                writer.delete_term(Term::from_field_text(self.mapping.id_field, id));
            }
            Ok(())
        })
    }

    /// Delete every document
    pub fn delete_all(&self) -> Result<()> {
        let _permit = self
            .gate
            .acquire_write(self.uuid(), self.settings.write_timeout())?;
        self.pair.with_writer(|writer| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }

    /// Commit pending mutations and refresh the searcher provider
    pub fn commit(&self) -> Result<u64> {
        let _permit = self
            .gate
            .acquire_write(self.uuid(), self.settings.write_timeout())?;
        let generation = self.pair.commit()?;
        self.pair.refresh()?;
        Ok(generation)
    }

    // ---- queries (read permit) --------------------------------------------

    /// Execute a query, returning the total hit count and the top `limit`
    /// hits
    pub fn search(&self, query: &SearchQuery, limit: usize) -> Result<SearchResults> {
        let _permit = self.gate.acquire_read(self.uuid())?;
        let lease = self.pair.acquire_searcher();
        let engine_query = query.resolve(&self.mapping, self.pair.index())?;

        let (top, total_hits) = lease.searcher().search(
            &engine_query,
            &(TopDocs::with_limit(limit.max(1)), Count),
        )?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top.into_iter().take(limit) {
            let doc: TantivyDocument = lease.searcher().doc(address)?;
            let id = doc
                .get_first(self.mapping.id_field)
                .and_then(|value| value.as_str())
                .map(str::to_string);
            hits.push(SearchHit { id, score });
        }
        lease.release();

        Ok(SearchResults { total_hits, hits })
    }

    /// Number of documents matching a query
    pub fn count(&self, query: &SearchQuery) -> Result<usize> {
        let _permit = self.gate.acquire_read(self.uuid())?;
        let lease = self.pair.acquire_searcher();
        let engine_query = query.resolve(&self.mapping, self.pair.index())?;
        let count = lease.searcher().search(&engine_query, &Count)?;
        lease.release();
        Ok(count)
    }

    /// Acquire a point-in-time searcher lease for direct engine access
    pub fn acquire_searcher(&self) -> Result<SearcherLease> {
        let _permit = self.gate.acquire_read(self.uuid())?;
        Ok(self.pair.acquire_searcher())
    }

    /// Swap in the latest committed state for future leases
    pub fn refresh(&self) -> Result<()> {
        self.pair.refresh()
    }

    // ---- replication ------------------------------------------------------

    /// The replication endpoint this master serves, for locators
    pub fn replication_master(&self) -> Option<Arc<ReplicationMaster>> {
        match &self.role {
            RoleEndpoint::Master { master, .. } => Some(master.clone()),
            RoleEndpoint::Slave { .. } => None,
        }
    }

    /// Run one sync cycle against the configured master (slave only)
    pub fn sync(&self) -> Result<SyncReport> {
        match &self.role {
            RoleEndpoint::Slave { slave } => slave.sync(&self.pair),
            RoleEndpoint::Master { .. } => {
                Err(Error::configuration("sync is only available on a slave index"))
            }
        }
    }

    /// Replication lag (slave only)
    pub fn replication_lag(&self) -> Option<ReplicationLag> {
        match &self.role {
            RoleEndpoint::Slave { slave } => Some(slave.lag()),
            RoleEndpoint::Master { .. } => None,
        }
    }

    // ---- backups ----------------------------------------------------------

    fn backup_manager(&self) -> Result<&BackupManager> {
        match &self.role {
            RoleEndpoint::Master {
                backup: Some(backup),
                ..
            } => Ok(backup),
            RoleEndpoint::Master { backup: None, .. } => Err(Error::configuration(
                "an in-memory index cannot be backed up",
            )),
            RoleEndpoint::Slave { .. } => {
                Err(Error::configuration("backups are only taken on the master"))
            }
        }
    }

    /// Create a backup of the current committed state
    pub fn create_backup(&self) -> Result<BackupEntry> {
        self.backup_manager()?.create_backup()
    }

    /// List retained backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        self.backup_manager()?.list_backups()
    }

    /// Prune backups to the `keep` most recent entries
    pub fn purge_backups(&self, keep: usize) -> Result<usize> {
        self.backup_manager()?.purge_backups(keep)
    }

    /// Restore a backup's file set into a fresh index layout
    pub fn restore_backup(&self, created_at: u64, target: &IndexPaths) -> Result<()> {
        self.backup_manager()?.restore(created_at, target)
    }

    // ---- status & lifecycle -----------------------------------------------

    /// Point-in-time status
    pub fn status(&self) -> IndexStatus {
        let held_snapshots = match &self.role {
            RoleEndpoint::Master { master, .. } => master.held_generations().len(),
            RoleEndpoint::Slave { .. } => 0,
        };
        IndexStatus {
            name: self.name.clone(),
            uuid: self.uuid(),
            role: self.role(),
            generation: self.generation(),
            num_docs: self.pair.num_docs(),
            held_snapshots,
        }
    }

    /// Start the periodic sync worker (slave only); a no-op when one is
    /// already running
    pub fn start_sync_worker(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.role() != IndexRole::Slave {
            return Err(Error::configuration(
                "the sync worker only runs on a slave index",
            ));
        }
        let mut worker = self.sync_worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let weak: Weak<IndexInstance> = Arc::downgrade(self);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let name = self.name.clone();

        let thread = std::thread::Builder::new()
            .name(format!("fathom-sync-{name}"))
            .spawn(move || loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(instance) = weak.upgrade() else { break };
                        if let Err(e) = instance.sync() {
                            // Transient failures retry on the next tick; the
                            // slave keeps serving its last synced generation
                            tracing::warn!(index = %name, error = %e, "periodic sync failed");
                        }
                    }
                }
            })
            .map_err(|e| Error::internal(format!("cannot spawn sync worker: {e}")))?;

        *worker = Some(SyncWorker {
            shutdown: shutdown_tx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the periodic sync worker, waiting for an in-flight cycle
    pub fn stop_sync_worker(&self) {
        if let Some(mut worker) = self.sync_worker.lock().take() {
            let _ = worker.shutdown.send(());
            if let Some(thread) = worker.thread.take() {
                // The worker itself may drop the last instance reference;
                // it cannot join its own thread
                if thread.thread().id() != std::thread::current().id() {
                    let _ = thread.join();
                }
            }
        }
    }
}

impl Drop for IndexInstance {
    fn drop(&mut self) {
        self.stop_sync_worker();
        self.gate.unregister(self.uuid());
        self.pair.close_writers();
        tracing::debug!(index = %self.name, "index instance closed");
    }
}
