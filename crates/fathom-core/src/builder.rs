//! Index instance builder
//!
//! Orchestrates directory provisioning, writer/searcher construction and
//! replication wiring for one index, as a state machine:
//!
//! ```text
//! UNINITIALIZED -> COMMON_BUILT -> ROLE_BUILT (MASTER | SLAVE) -> READY
//!        \              \                \
//!         +--------------+----------------+--> ABORTED
//! ```
//!
//! On any failure everything opened so far is released in reverse
//! acquisition order and the error is rethrown; a partially built instance
//! never escapes. Master and slave are two constructor paths over a shared
//! common stage, both producing the same instance shape.

use crate::backup::BackupManager;
use crate::directory::{open_index, DirLock, IndexPaths, WriteCache};
use crate::gate::{GateLimits, ReadWriteGate};
use crate::instance::{IndexInstance, RoleEndpoint};
use crate::mapping::ResolvedMapping;
use crate::metadata::IndexMetadata;
use crate::pair::WriterAndSearcher;
use crate::replication::master::ReplicationMaster;
use crate::replication::slave::ReplicationSlave;
use crate::replication::snapshot::SnapshotRegistry;
use crate::replication::MasterLocator;
use crate::settings::{BackendKind, IndexRole, IndexSettings, MergeScheduler};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tantivy::merge_policy::{LogMergePolicy, NoMergePolicy};
use tantivy::{Index, IndexWriter, TantivyDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderStage {
    Uninitialized,
    CommonBuilt,
    RoleBuilt,
    Ready,
    Aborted,
}

/// Builder for one [`IndexInstance`]
pub struct IndexInstanceBuilder {
    name: String,
    settings: IndexSettings,
    paths: IndexPaths,
    gate: Arc<ReadWriteGate>,
    locator: Arc<dyn MasterLocator>,
    stage: BuilderStage,
    generation: Arc<AtomicU64>,

    // Progressively acquired resources, released in reverse order on abort
    lock: Option<DirLock>,
    metadata: Option<IndexMetadata>,
    mapping: Option<ResolvedMapping>,
    index: Option<Index>,
    writer: Option<IndexWriter<TantivyDocument>>,
    taxonomy: Option<crate::taxonomy::TaxonomyStore>,
    registry: Option<Arc<SnapshotRegistry>>,
    pair: Option<WriterAndSearcher>,
    role: Option<RoleEndpoint>,
}

impl IndexInstanceBuilder {
    /// Builder for the index named `name` rooted at `paths`
    pub fn new(
        name: impl Into<String>,
        paths: IndexPaths,
        settings: IndexSettings,
        gate: Arc<ReadWriteGate>,
        locator: Arc<dyn MasterLocator>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            paths,
            gate,
            locator,
            stage: BuilderStage::Uninitialized,
            generation: Arc::new(AtomicU64::new(0)),
            lock: None,
            metadata: None,
            mapping: None,
            index: None,
            writer: None,
            taxonomy: None,
            registry: None,
            pair: None,
            role: None,
        }
    }

    /// Run the build. On failure the builder aborts, releasing every
    /// resource it acquired, and rethrows the error.
    pub fn build(mut self) -> Result<IndexInstance> {
        match self.try_build() {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn try_build(&mut self) -> Result<IndexInstance> {
        self.settings.validate().map_err(Error::Configuration)?;
        self.build_common()?;
        match self.settings.role() {
            IndexRole::Slave => self.build_slave()?,
            IndexRole::Master => self.build_master()?,
        }
        self.stage = BuilderStage::RoleBuilt;
        self.finish()
    }

    /// COMMON_BUILT: directories provisioned and locked, field mapping
    /// resolved, metadata record loaded or created. No writer open yet.
    fn build_common(&mut self) -> Result<()> {
        let mapping = self.settings.fields.resolve()?;
        let with_taxonomy = mapping.requires_taxonomy();

        self.paths.ensure(with_taxonomy)?;
        if self.settings.backend == BackendKind::Fs {
            self.lock = Some(DirLock::acquire(&self.paths.lock)?);
        }

        let role = self.settings.role();
        let mut metadata = match IndexMetadata::load(&self.paths.metadata)? {
            Some(existing) => existing,
            None => IndexMetadata::create(role),
        };
        if metadata.role != role {
            metadata.role = role;
        }
        metadata.store(&self.paths.metadata)?;

        self.metadata = Some(metadata);
        self.mapping = Some(mapping);
        self.stage = BuilderStage::CommonBuilt;
        Ok(())
    }

    fn open_data_index(&self) -> Result<Index> {
        let mapping = self.mapping.as_ref().ok_or_else(|| {
            Error::internal("builder stage violation: mapping not resolved")
        })?;
        let mut index = open_index(
            self.settings.backend,
            &self.paths.data,
            mapping.schema.clone(),
        )?;
        if let Some(threads) = self.settings.search_threads {
            if threads > 1 {
                index.set_multithread_executor(threads)?;
            }
        }
        Ok(index)
    }

    /// Open the writer with create-or-append semantics and commit
    /// immediately: a clean baseline even after a prior crash.
    fn open_writer(&mut self, index: &Index) -> Result<IndexWriter<TantivyDocument>> {
        let scheduler = self.settings.merge_scheduler;
        let threads = scheduler.map(MergeScheduler::thread_count).unwrap_or(1);
        let mut writer =
            index.writer_with_num_threads::<TantivyDocument>(threads, self.settings.writer_budget())?;

        if scheduler == Some(MergeScheduler::None) {
            writer.set_merge_policy(Box::new(NoMergePolicy));
        } else if self.settings.merge_min_segments.is_some()
            || self.settings.merge_max_docs.is_some()
            || self.settings.merge_level_log_size.is_some()
        {
            // Merge parameters are applied only when explicitly configured;
            // otherwise the engine defaults stand
            let mut policy = LogMergePolicy::default();
            if let Some(min_segments) = self.settings.merge_min_segments {
                policy.set_min_num_segments(min_segments);
            }
            if let Some(max_docs) = self.settings.merge_max_docs {
                policy.set_max_docs_before_merge(max_docs);
            }
            if let Some(level_log_size) = self.settings.merge_level_log_size {
                policy.set_level_log_size(level_log_size);
            }
            writer.set_merge_policy(Box::new(policy));
        }

        let baseline = writer.commit()?;
        self.generation.store(baseline, Ordering::SeqCst);
        Ok(writer)
    }

    /// ROLE_BUILT(MASTER): live writer, snapshot registry, replication
    /// master endpoint, backup manager, writer+searcher pair around the
    /// live writer.
    fn build_master(&mut self) -> Result<()> {
        let index = self.open_data_index()?;
        let writer = self.open_writer(&index)?;
        self.writer = Some(writer);
        self.index = Some(index);

        let mapping_needs_taxonomy = self
            .mapping
            .as_ref()
            .is_some_and(ResolvedMapping::requires_taxonomy);
        if mapping_needs_taxonomy {
            let taxonomy = crate::taxonomy::TaxonomyStore::open_writable(
                self.settings.backend,
                &self.paths.taxonomy,
            )?;
            taxonomy.commit()?;
            self.taxonomy = Some(taxonomy);
        }

        let uuid = self.metadata.as_ref().map(|m| m.uuid).unwrap_or_default();
        if self.settings.backend == BackendKind::Fs {
            self.registry = Some(Arc::new(SnapshotRegistry::new(
                uuid,
                self.paths.clone(),
                mapping_needs_taxonomy,
            )));
        }

        let master = Arc::new(ReplicationMaster::new(
            uuid,
            self.generation.clone(),
            self.registry.clone(),
        ));
        let backup = self.registry.clone().map(|registry| {
            let backup_root = self
                .settings
                .backup_root
                .clone()
                .unwrap_or_else(|| self.paths.backups.clone());
            BackupManager::new(backup_root, registry, self.generation.clone())
        });

        let index = self.index.take().ok_or_else(stage_violation)?;
        let writer = self.writer.take();
        self.pair = Some(match self.taxonomy.take() {
            Some(taxonomy) => WriterAndSearcher::with_index_and_taxo(
                index,
                writer,
                taxonomy,
                self.generation.clone(),
            )?,
            None => WriterAndSearcher::with_index(index, writer, self.generation.clone())?,
        });
        self.role = Some(RoleEndpoint::Master { master, backup });
        Ok(())
    }

    /// ROLE_BUILT(SLAVE): writer opened then immediately closed to
    /// establish or repair the local files, replication slave endpoint
    /// pointed at the configured master, pair in read-only mode.
    fn build_slave(&mut self) -> Result<()> {
        let index = self.open_data_index()?;
        {
            let repair_writer = self.open_writer(&index)?;
            drop(repair_writer);
        }
        self.index = Some(index);

        let mapping_needs_taxonomy = self
            .mapping
            .as_ref()
            .is_some_and(ResolvedMapping::requires_taxonomy);
        if mapping_needs_taxonomy {
            // Establish the namespace the same way, then drop write access
            let taxonomy = crate::taxonomy::TaxonomyStore::open_writable(
                self.settings.backend,
                &self.paths.taxonomy,
            )?;
            taxonomy.commit()?;
            drop(taxonomy);
            self.taxonomy = Some(crate::taxonomy::TaxonomyStore::open_read_only(
                self.settings.backend,
                &self.paths.taxonomy,
            )?);
        }

        let remote = self
            .settings
            .master
            .clone()
            .ok_or_else(|| Error::configuration("slave settings without a remote master"))?;
        let slave = ReplicationSlave::new(
            self.paths.clone(),
            remote,
            self.locator.clone(),
            mapping_needs_taxonomy,
            WriteCache::from_settings(&self.settings),
        );

        let index = self.index.take().ok_or_else(stage_violation)?;
        self.pair = Some(match self.taxonomy.take() {
            Some(taxonomy) => WriterAndSearcher::with_index_and_taxo(
                index,
                None,
                taxonomy,
                self.generation.clone(),
            )?,
            None => WriterAndSearcher::with_index(index, None, self.generation.clone())?,
        });
        self.role = Some(RoleEndpoint::Slave { slave });
        Ok(())
    }

    /// READY: hand the assembled instance to the caller
    fn finish(&mut self) -> Result<IndexInstance> {
        let metadata = self.metadata.take().ok_or_else(stage_violation)?;
        let mapping = self.mapping.take().ok_or_else(stage_violation)?;
        let pair = self.pair.take().ok_or_else(stage_violation)?;
        let role = self.role.take().ok_or_else(stage_violation)?;

        self.gate.register(
            metadata.uuid,
            GateLimits {
                max_reads: self.settings.max_concurrent_reads,
                max_writes: self.settings.max_concurrent_writes.unwrap_or(1),
            },
        );

        self.stage = BuilderStage::Ready;
        tracing::info!(index = %self.name, uuid = %metadata.uuid, role = ?metadata.role,
            "index instance ready");

        Ok(IndexInstance::assemble(
            std::mem::take(&mut self.name),
            metadata,
            self.settings.clone(),
            self.paths.clone(),
            mapping,
            self.gate.clone(),
            pair,
            role,
            self.generation.clone(),
            self.lock.take(),
        ))
    }

    /// ABORTED: release everything acquired so far, in reverse acquisition
    /// order
    fn abort(&mut self) {
        tracing::warn!(index = %self.name, stage = ?self.stage, "aborting index build");
        self.role = None;
        self.pair = None;
        self.registry = None;
        self.taxonomy = None;
        self.writer = None;
        self.index = None;
        self.mapping = None;
        self.metadata = None;
        self.lock = None;
        self.stage = BuilderStage::Aborted;
    }
}

fn stage_violation() -> Error {
    Error::internal("builder stage violation")
}
