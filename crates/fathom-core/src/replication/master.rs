//! Master side of the replication protocol
//!
//! Serves the three operations slaves consume: identity, snapshot
//! manifests, and byte-range reads against pinned captures. Reads operate
//! on the immutable capture, never the live directory, so slow replication
//! reads never block writers.

use crate::replication::manifest::{Namespace, SnapshotManifest};
use crate::replication::snapshot::SnapshotRegistry;
use crate::replication::MasterEndpoint;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Master-side replication statistics
#[derive(Debug, Clone, Default)]
pub struct MasterReplicationStats {
    /// Snapshots pinned
    pub snapshots_taken: u64,
    /// Snapshots released
    pub snapshots_released: u64,
    /// File chunks served
    pub chunks_served: u64,
    /// Bytes served to slaves and backups
    pub bytes_served: u64,
}

/// Replication master endpoint for one index
pub struct ReplicationMaster {
    uuid: Uuid,
    generation: Arc<AtomicU64>,
    registry: Option<Arc<SnapshotRegistry>>,
    stats: Mutex<MasterReplicationStats>,
}

impl ReplicationMaster {
    /// Master over the given registry.
    ///
    /// `registry` is `None` for in-memory indexes, which cannot serve
    /// file-shipping snapshots.
    pub fn new(
        uuid: Uuid,
        generation: Arc<AtomicU64>,
        registry: Option<Arc<SnapshotRegistry>>,
    ) -> Self {
        Self {
            uuid,
            generation,
            registry,
            stats: Mutex::new(MasterReplicationStats::default()),
        }
    }

    fn registry(&self) -> Result<&Arc<SnapshotRegistry>> {
        self.registry.as_ref().ok_or_else(|| {
            Error::configuration("an in-memory index cannot serve replication snapshots")
        })
    }

    /// Stable identity of this master
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Last committed generation
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Generations currently pinned, with reference counts
    pub fn held_generations(&self) -> Vec<(u64, u32)> {
        self.registry
            .as_ref()
            .map(|registry| registry.held())
            .unwrap_or_default()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MasterReplicationStats {
        self.stats.lock().clone()
    }
}

impl MasterEndpoint for ReplicationMaster {
    fn master_uuid(&self) -> Result<Uuid> {
        Ok(self.uuid)
    }

    fn new_snapshot(&self) -> Result<SnapshotManifest> {
        let generation = self.current_generation();
        let manifest = self.registry()?.acquire(generation)?;
        self.stats.lock().snapshots_taken += 1;
        tracing::debug!(
            master = %self.uuid,
            generation,
            files = manifest.file_count(),
            "snapshot served"
        );
        Ok(manifest)
    }

    fn read_file(
        &self,
        generation: u64,
        namespace: Namespace,
        name: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        let chunk = self
            .registry()?
            .read_chunk(generation, namespace, name, offset, len)?;
        let mut stats = self.stats.lock();
        stats.chunks_served += 1;
        stats.bytes_served += chunk.len() as u64;
        Ok(chunk)
    }

    fn release_snapshot(&self, generation: u64) -> Result<()> {
        self.registry()?.release(generation)?;
        self.stats.lock().snapshots_released += 1;
        Ok(())
    }
}
