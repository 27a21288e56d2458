//! Writer and searcher pair
//!
//! Owns the mutable write handle (when this node is a master) and the
//! refreshable, reference-counted read-only snapshot provider for one
//! index, in either its index-only or index-and-taxonomy variant.
//!
//! Snapshot acquisition is reference-count bookkeeping only and never
//! blocks: a lease stays valid and consistent across concurrent commits
//! and refreshes, because it pins the segment readers it was created from.

use crate::taxonomy::TaxonomyStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument};

/// A point-in-time searcher snapshot.
///
/// The lease keeps the underlying segment readers alive; dropping it is the
/// single release. Refreshes and syncs that happen while a lease is out do
/// not affect it.
pub struct SearcherLease {
    searcher: Searcher,
    taxonomy: Option<Searcher>,
    generation: u64,
}

impl SearcherLease {
    /// The engine searcher for the primary namespace
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    /// The taxonomy searcher, when the index carries facets
    pub fn taxonomy_searcher(&self) -> Option<&Searcher> {
        self.taxonomy.as_ref()
    }

    /// Generation the lease was acquired at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release the lease. Equivalent to dropping it; provided so call sites
    /// can make the release explicit.
    pub fn release(self) {}
}

/// Writer plus refreshable searcher provider for one index
pub struct WriterAndSearcher {
    index: Index,
    writer: Option<Mutex<IndexWriter<TantivyDocument>>>,
    reader: IndexReader,
    taxonomy: Option<TaxonomyStore>,
    generation: Arc<AtomicU64>,
}

impl WriterAndSearcher {
    /// Pair over a single primary namespace.
    ///
    /// `writer` is `None` for the read-only (slave) variant.
    pub fn with_index(
        index: Index,
        writer: Option<IndexWriter<TantivyDocument>>,
        generation: Arc<AtomicU64>,
    ) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            writer: writer.map(Mutex::new),
            reader,
            taxonomy: None,
            generation,
        })
    }

    /// Pair over a primary namespace plus a taxonomy namespace
    pub fn with_index_and_taxo(
        index: Index,
        writer: Option<IndexWriter<TantivyDocument>>,
        taxonomy: TaxonomyStore,
        generation: Arc<AtomicU64>,
    ) -> Result<Self> {
        let mut pair = Self::with_index(index, writer, generation)?;
        pair.taxonomy = Some(taxonomy);
        Ok(pair)
    }

    /// The engine index
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The taxonomy namespace, when present
    pub fn taxonomy(&self) -> Option<&TaxonomyStore> {
        self.taxonomy.as_ref()
    }

    /// True when no writer is held (slave variant)
    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    /// Last committed generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record a generation adopted from elsewhere (a completed sync)
    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    /// Run `f` against the live writer, serialized against other writer use
    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter<TantivyDocument>) -> Result<T>,
    ) -> Result<T> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::configuration("index is read-only (slave)"))?;
        f(&mut writer.lock())
    }

    /// Acquire a consistent point-in-time snapshot. Never blocks.
    pub fn acquire_searcher(&self) -> SearcherLease {
        SearcherLease {
            searcher: self.reader.searcher(),
            taxonomy: self.taxonomy.as_ref().map(|t| t.searcher()),
            generation: self.generation(),
        }
    }

    /// Commit pending mutations, making them visible to refreshed readers.
    ///
    /// The taxonomy namespace commits first so facet labels are durable
    /// before documents referencing them.
    pub fn commit(&self) -> Result<u64> {
        if let Some(taxonomy) = &self.taxonomy {
            taxonomy.commit()?;
        }
        let opstamp = self.with_writer(|writer| Ok(writer.commit()?))?;
        self.generation.store(opstamp, Ordering::SeqCst);
        Ok(opstamp)
    }

    /// Atomically swap in the latest committed state for future snapshot
    /// acquisitions. Already-acquired leases are unaffected.
    pub fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        if let Some(taxonomy) = &self.taxonomy {
            taxonomy.reload()?;
        }
        Ok(())
    }

    /// Number of committed documents visible to new leases
    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Drop the writers, releasing the engine writer locks
    pub fn close_writers(&mut self) {
        self.writer = None;
        if let Some(taxonomy) = &mut self.taxonomy {
            taxonomy.close_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::mapping::{FieldKind, FieldMapping, ResolvedMapping};
    use tempfile::TempDir;

    fn open_pair(dir: &TempDir) -> (WriterAndSearcher, ResolvedMapping) {
        let resolved = FieldMapping::new()
            .field("title", FieldKind::text())
            .resolve()
            .unwrap();
        let index = crate::directory::open_index(
            crate::settings::BackendKind::Fs,
            dir.path(),
            resolved.schema.clone(),
        )
        .unwrap();
        let writer = index
            .writer_with_num_threads::<TantivyDocument>(1, 15_000_000)
            .unwrap();
        let pair =
            WriterAndSearcher::with_index(index, Some(writer), Arc::new(AtomicU64::new(0)))
                .unwrap();
        (pair, resolved)
    }

    fn add(pair: &WriterAndSearcher, mapping: &ResolvedMapping, id: &str, title: &str) {
        let (doc, _) = Document::new(id).text("title", title).to_engine(mapping).unwrap();
        pair.with_writer(|writer| {
            writer.add_document(doc)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_commit_and_refresh_make_docs_visible() {
        let dir = TempDir::new().unwrap();
        let (pair, mapping) = open_pair(&dir);

        add(&pair, &mapping, "1", "walnut desk");
        assert_eq!(pair.num_docs(), 0);

        pair.commit().unwrap();
        pair.refresh().unwrap();
        assert_eq!(pair.num_docs(), 1);
        assert!(pair.generation() > 0);
    }

    #[test]
    fn test_lease_survives_refresh() {
        let dir = TempDir::new().unwrap();
        let (pair, mapping) = open_pair(&dir);

        add(&pair, &mapping, "1", "first");
        pair.commit().unwrap();
        pair.refresh().unwrap();

        let lease = pair.acquire_searcher();
        assert_eq!(lease.searcher().num_docs(), 1);

        add(&pair, &mapping, "2", "second");
        pair.commit().unwrap();
        pair.refresh().unwrap();

        // The old lease still sees exactly the pre-refresh state
        assert_eq!(lease.searcher().num_docs(), 1);
        assert_eq!(pair.acquire_searcher().searcher().num_docs(), 2);
        lease.release();
    }

    #[test]
    fn test_read_only_pair_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let resolved = FieldMapping::new()
            .field("title", FieldKind::text())
            .resolve()
            .unwrap();
        let index = crate::directory::open_index(
            crate::settings::BackendKind::Fs,
            dir.path(),
            resolved.schema,
        )
        .unwrap();
        let pair =
            WriterAndSearcher::with_index(index, None, Arc::new(AtomicU64::new(0))).unwrap();

        assert!(pair.is_read_only());
        assert!(pair.commit().is_err());
        assert!(pair.refresh().is_ok());
    }
}
