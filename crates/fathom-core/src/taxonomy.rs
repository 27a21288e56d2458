//! Taxonomy namespace
//!
//! The secondary storage for hierarchical facet label data, kept separate
//! from the primary document index. It is a small engine-backed registry
//! mapping each facet path (and its ancestors) to a stable ordinal, written
//! through the same writer lifecycle as the primary namespace and shipped
//! by replication and backup exactly like it.

use crate::directory::open_index;
use crate::settings::BackendKind;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tantivy::collector::TopDocs;
use tantivy::query::TermQuery;
use tantivy::schema::{
    Field, IndexRecordOption, Schema, Value, INDEXED, STORED, STRING,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const PATH_FIELD: &str = "path";
const ORDINAL_FIELD: &str = "ordinal";

/// Writer memory budget for the label registry; labels are tiny
const TAXONOMY_WRITER_BUDGET: usize = 15_000_000;

fn taxonomy_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field(PATH_FIELD, STRING | STORED);
    builder.add_u64_field(ORDINAL_FIELD, INDEXED | STORED);
    builder.build()
}

/// Facet label registry over the taxonomy namespace
pub struct TaxonomyStore {
    index: Index,
    writer: Option<Mutex<IndexWriter<TantivyDocument>>>,
    reader: IndexReader,
    path_field: Field,
    ordinal_field: Field,
    next_ordinal: AtomicU64,
    known: DashMap<String, u64>,
}

impl TaxonomyStore {
    /// Open the namespace with a live writer (master path)
    pub fn open_writable(kind: BackendKind, dir: &Path) -> Result<Self> {
        Self::open(kind, dir, true)
    }

    /// Open the namespace read-only (slave path)
    pub fn open_read_only(kind: BackendKind, dir: &Path) -> Result<Self> {
        Self::open(kind, dir, false)
    }

    fn open(kind: BackendKind, dir: &Path, writable: bool) -> Result<Self> {
        let index = open_index(kind, dir, taxonomy_schema())?;
        let schema = index.schema();
        let path_field = schema.get_field(PATH_FIELD)?;
        let ordinal_field = schema.get_field(ORDINAL_FIELD)?;

        let writer = if writable {
            Some(Mutex::new(index.writer_with_num_threads::<TantivyDocument>(
                1,
                TAXONOMY_WRITER_BUDGET,
            )?))
        } else {
            None
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let next_ordinal = AtomicU64::new(reader.searcher().num_docs());

        Ok(Self {
            index,
            writer,
            reader,
            path_field,
            ordinal_field,
            next_ordinal,
            known: DashMap::new(),
        })
    }

    fn writer(&self) -> Result<&Mutex<IndexWriter<TantivyDocument>>> {
        self.writer
            .as_ref()
            .ok_or_else(|| Error::configuration("taxonomy namespace is read-only"))
    }

    /// Register a facet path and all its ancestors, assigning ordinals to
    /// labels not seen before. New labels become durable on the next commit.
    pub fn register(&self, path: &str) -> Result<()> {
        for label in ancestor_paths(path) {
            if self.known.contains_key(&label) {
                continue;
            }
            if let Some(ordinal) = self.lookup_committed(&label)? {
                self.known.insert(label, ordinal);
                continue;
            }
            let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
            let mut doc = TantivyDocument::new();
            doc.add_text(self.path_field, &label);
            doc.add_u64(self.ordinal_field, ordinal);
            self.writer()?.lock().add_document(doc)?;
            self.known.insert(label, ordinal);
        }
        Ok(())
    }

    /// Ordinal of a label, if registered
    pub fn ordinal(&self, path: &str) -> Result<Option<u64>> {
        if let Some(entry) = self.known.get(path) {
            return Ok(Some(*entry.value()));
        }
        self.lookup_committed(path)
    }

    fn lookup_committed(&self, path: &str) -> Result<Option<u64>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.path_field, path),
            IndexRecordOption::Basic,
        );
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_, address)) = top.first() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(*address)?;
        Ok(doc
            .get_first(self.ordinal_field)
            .and_then(|value| value.as_u64()))
    }

    /// Commit pending label registrations
    pub fn commit(&self) -> Result<()> {
        self.writer()?.lock().commit()?;
        Ok(())
    }

    /// Reload the reader to the latest committed state
    pub fn reload(&self) -> Result<()> {
        self.reader.reload()?;
        // Synced slaves may have received labels registered elsewhere
        self.next_ordinal
            .fetch_max(self.reader.searcher().num_docs(), Ordering::SeqCst);
        Ok(())
    }

    /// Number of committed labels
    pub fn label_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Point-in-time searcher over the committed label registry
    pub fn searcher(&self) -> tantivy::Searcher {
        self.reader.searcher()
    }

    /// The underlying engine index
    pub fn engine(&self) -> &Index {
        &self.index
    }

    /// Drop the writer, releasing the namespace writer lock
    pub fn close_writer(&mut self) {
        self.writer = None;
    }
}

/// All ancestor paths of a facet path, shortest first, including the path
/// itself. `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn ancestor_paths(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}
