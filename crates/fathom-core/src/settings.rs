//! Per-index settings
//!
//! An [`IndexSettings`] record is the configuration object the service layer
//! hands to the builder. It selects the storage backend, the merge behavior,
//! the concurrency limits, and - when a remote master is named - the
//! replication role of the index.

use crate::mapping::FieldMapping;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default write-back cache limit for a single streamed file, in megabytes
pub const DEFAULT_CACHE_MAX_MERGE_MB: f64 = 5.0;

/// Default write-back cache total budget, in megabytes
pub const DEFAULT_CACHE_MAX_TOTAL_MB: f64 = 60.0;

/// Default writer memory budget, in bytes
pub const DEFAULT_WRITER_BUDGET_BYTES: usize = 50_000_000;

/// Default bounded wait for a write permit
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage backend for an index directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Persistent, filesystem-backed (mmap) storage
    #[default]
    Fs,
    /// Pure in-memory storage; cannot be replicated or backed up
    Ram,
}

/// Merge execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeScheduler {
    /// Background merging disabled entirely
    None,
    /// Single indexing thread, merges execute serially
    Serial,
    /// Thread count clamped to `max(1, min(4, cpus / 2))`
    Concurrent,
}

impl MergeScheduler {
    /// Number of indexing threads this strategy maps to
    pub fn thread_count(self) -> usize {
        match self {
            MergeScheduler::None | MergeScheduler::Serial => 1,
            MergeScheduler::Concurrent => num_cpus::get().div_euclid(2).clamp(1, 4),
        }
    }
}

/// Remote master an index replicates from.
///
/// An index is a slave if and only if both the schema and the index name are
/// present and non-empty; absence of either field means master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteName {
    /// Schema (tenant namespace) the master index lives in
    pub schema: Option<String>,
    /// Name of the master index
    pub index: Option<String>,
}

impl RemoteName {
    /// Fully-named remote, selecting slave role
    pub fn of(schema: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            index: Some(index.into()),
        }
    }

    /// True when both fields are present and non-empty
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.schema) && filled(&self.index)
    }
}

/// Replication role selected by the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexRole {
    /// Writable primary; owns the writer and serves snapshots
    Master,
    /// Read-only follower; pulls segment files from a master
    Slave,
}

/// Settings for a single index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Storage backend kind
    #[serde(default)]
    pub backend: BackendKind,

    /// Field name to field kind mapping
    #[serde(default)]
    pub fields: FieldMapping,

    /// Writer memory budget in bytes
    pub writer_budget_bytes: Option<usize>,

    /// Merge execution strategy; engine default when unset
    pub merge_scheduler: Option<MergeScheduler>,

    /// Minimum number of segments considered for one merge pass
    pub merge_min_segments: Option<usize>,

    /// Segments above this document count are never merged
    pub merge_max_docs: Option<usize>,

    /// Log-merge level size; engine default when unset
    pub merge_level_log_size: Option<f64>,

    /// Per-segment search threads; single-threaded search when unset or zero
    pub search_threads: Option<usize>,

    /// Write-back cache: largest single streamed file to buffer, in MB.
    /// Zero disables caching.
    pub cache_max_merge_mb: Option<f64>,

    /// Write-back cache: total in-memory budget, in MB. Zero disables caching.
    pub cache_max_total_mb: Option<f64>,

    /// Maximum concurrent read permits; unbounded when unset
    pub max_concurrent_reads: Option<u32>,

    /// Maximum concurrent write permits
    pub max_concurrent_writes: Option<u32>,

    /// Default bounded wait for a write permit, in milliseconds
    pub write_timeout_ms: Option<u64>,

    /// Remote master to replicate from; selects slave role when complete
    pub master: Option<RemoteName>,

    /// Periodic sync interval for slaves, in milliseconds; on-demand only
    /// when unset
    pub sync_interval_ms: Option<u64>,

    /// Root directory for backup entries; defaults to `<index>/backups`
    pub backup_root: Option<PathBuf>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Fs,
            fields: FieldMapping::default(),
            writer_budget_bytes: None,
            merge_scheduler: None,
            merge_min_segments: None,
            merge_max_docs: None,
            merge_level_log_size: None,
            search_threads: None,
            cache_max_merge_mb: None,
            cache_max_total_mb: None,
            max_concurrent_reads: None,
            max_concurrent_writes: None,
            write_timeout_ms: None,
            master: None,
            sync_interval_ms: None,
            backup_root: None,
        }
    }
}

impl IndexSettings {
    /// Settings for a writable master index with the given fields
    pub fn master(fields: FieldMapping) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    /// Settings for a slave index replicating from `remote`
    pub fn slave(fields: FieldMapping, remote: RemoteName) -> Self {
        Self {
            fields,
            master: Some(remote),
            ..Default::default()
        }
    }

    /// Set the storage backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the merge scheduler
    pub fn with_merge_scheduler(mut self, scheduler: MergeScheduler) -> Self {
        self.merge_scheduler = Some(scheduler);
        self
    }

    /// Set the periodic sync interval
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Set the bounded write-permit wait
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Role selected by these settings: slave iff a complete remote is named
    pub fn role(&self) -> IndexRole {
        match &self.master {
            Some(remote) if remote.is_complete() => IndexRole::Slave,
            _ => IndexRole::Master,
        }
    }

    /// Effective write-permit timeout
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WRITE_TIMEOUT)
    }

    /// Effective writer budget
    pub fn writer_budget(&self) -> usize {
        self.writer_budget_bytes.unwrap_or(DEFAULT_WRITER_BUDGET_BYTES)
    }

    /// Validate the settings; called by the builder before any resource is
    /// opened
    pub fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.max_concurrent_writes {
            return Err("max_concurrent_writes must be at least 1".into());
        }
        if let Some(0) = self.max_concurrent_reads {
            return Err("max_concurrent_reads must be at least 1 when bounded".into());
        }
        if let Some(budget) = self.writer_budget_bytes {
            if budget < 3_000_000 {
                return Err("writer_budget_bytes must be at least 3MB".into());
            }
        }
        if self.role() == IndexRole::Slave && self.backend == BackendKind::Ram {
            return Err("a slave index requires a filesystem backend".into());
        }
        Ok(())
    }
}
