//! Master/slave segment-file replication
//!
//! Ships a consistent, crash-safe copy of index segment files from a
//! writable master to read-only followers without ever exposing a
//! partially-written state:
//!
//! - The master pins a commit point through the held-generations registry
//!   and serves its file manifest plus byte-range reads against the pinned
//!   capture ([`master::ReplicationMaster`]).
//! - The slave diffs the manifest against its local files, downloads the
//!   difference into a staging area in retryable chunks, promotes the
//!   staged files atomically, and only then deletes superseded files
//!   ([`slave::ReplicationSlave`]).
//!
//! The wire carriage for the master operations is out of scope; the
//! [`MasterEndpoint`] trait defines the logical operations and an
//! in-process locator wires slaves to local masters. Transport adapters
//! implement the same trait upstream.

pub mod manifest;
pub mod master;
pub mod slave;
pub mod snapshot;

pub use manifest::{FileEntry, Namespace, SnapshotManifest, SyncPlan};
pub use master::{MasterReplicationStats, ReplicationMaster};
pub use slave::{ReplicationSlave, SlaveStats, SyncReport};
pub use snapshot::SnapshotRegistry;

use crate::settings::RemoteName;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Chunk size for file transfer; each chunk retries independently
pub const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// Attempts per chunk before the file download fails
pub const CHUNK_RETRIES: u32 = 3;

/// Full-file download attempts before a checksum mismatch is surfaced as
/// corruption
pub const FILE_RETRIES: u32 = 2;

/// Snapshot capture attempts; a capture can lose a race against the
/// engine's file garbage collection and is simply retaken
pub const CAPTURE_RETRIES: u32 = 3;

/// Engine commit-point metadata file. Captured first and promoted last:
/// it is what defines the commit, so every file it references must already
/// be complete when it lands.
pub(crate) const ENGINE_META_FILE: &str = "meta.json";

/// The three master-side operations consumed by slaves.
///
/// Implemented directly by [`ReplicationMaster`] for in-process replication
/// and by transport clients for remote masters.
pub trait MasterEndpoint: Send + Sync {
    /// Identity check; a changed UUID means the master's backing data was
    /// replaced and an incremental sync would be unsound
    fn master_uuid(&self) -> Result<Uuid>;

    /// Pin a fresh snapshot of the current committed state and return its
    /// manifest; the generation stays undeletable until released
    fn new_snapshot(&self) -> Result<SnapshotManifest>;

    /// Random-access read of a snapshotted file, enabling resumable
    /// transfer
    fn read_file(
        &self,
        generation: u64,
        namespace: Namespace,
        name: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes>;

    /// Drop the hold on a generation; overlapping holds from other slaves
    /// are unaffected
    fn release_snapshot(&self, generation: u64) -> Result<()>;
}

/// Resolves a configured remote name to a master endpoint.
///
/// Resolution happens per sync cycle, so a slave builds and serves queries
/// even while its master is unreachable.
pub trait MasterLocator: Send + Sync {
    /// Find the endpoint for `remote`
    fn locate(&self, remote: &RemoteName) -> Result<Arc<dyn MasterEndpoint>>;
}

/// Replication lag reported by a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationLag {
    /// Generation of the last successful local sync
    pub local_generation: u64,
    /// Last-known master generation
    pub master_generation: u64,
}

impl ReplicationLag {
    /// Generations the slave is behind
    pub fn behind(&self) -> u64 {
        self.master_generation.saturating_sub(self.local_generation)
    }
}
