//! Directory provisioning and on-disk layout
//!
//! Resolves a logical index to its physical storage: the primary `data/`
//! namespace, the optional `taxonomy/` namespace, plus the snapshot,
//! staging and backup areas used by replication and the backup manager.
//!
//! An instance-level lock file enforces the one-writer-per-directory
//! invariant on top of the engine's own writer lock: a second open of the
//! same index root fails while the first instance is live.

use crate::settings::{
    BackendKind, IndexSettings, DEFAULT_CACHE_MAX_MERGE_MB, DEFAULT_CACHE_MAX_TOTAL_MB,
};
use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tantivy::directory::MmapDirectory;
use tantivy::schema::Schema;
use tantivy::Index;

/// Name of the instance-level lock file
pub const LOCK_FILE: &str = ".fathom.lock";

/// Name of the per-index metadata record
pub const METADATA_FILE: &str = "metadata.json";

/// On-disk layout of one index
#[derive(Debug, Clone)]
pub struct IndexPaths {
    /// Index root directory
    pub root: PathBuf,
    /// Primary engine namespace
    pub data: PathBuf,
    /// Secondary facet-label namespace
    pub taxonomy: PathBuf,
    /// Pinned snapshot captures, one directory per held generation
    pub snapshots: PathBuf,
    /// Slave download staging area
    pub staging: PathBuf,
    /// Backup entries
    pub backups: PathBuf,
    /// Metadata record path
    pub metadata: PathBuf,
    /// Lock file path
    pub lock: PathBuf,
}

impl IndexPaths {
    /// Lay out the paths under `root`
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join("data"),
            taxonomy: root.join("taxonomy"),
            snapshots: root.join("snapshots"),
            staging: root.join("staging"),
            backups: root.join("backups"),
            metadata: root.join(METADATA_FILE),
            lock: root.join(LOCK_FILE),
            root,
        }
    }

    /// Create the directories an instance needs
    pub fn ensure(&self, with_taxonomy: bool) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.data)?;
        if with_taxonomy {
            fs::create_dir_all(&self.taxonomy)?;
        }
        Ok(())
    }

    /// Namespace directory for the given replication namespace name
    pub fn namespace_dir(&self, taxonomy: bool) -> &Path {
        if taxonomy {
            &self.taxonomy
        } else {
            &self.data
        }
    }
}

/// Exclusive instance lock on an index root.
///
/// Created with `create_new` so a concurrent holder fails fast; removed on
/// drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock, failing if another instance holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("cannot lock index directory {}: {e}", path.display()),
                ))
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Open the engine index over the requested backend, creating it when the
/// directory holds no index yet
pub fn open_index(kind: BackendKind, path: &Path, schema: Schema) -> Result<Index> {
    match kind {
        BackendKind::Fs => {
            fs::create_dir_all(path)?;
            let dir = MmapDirectory::open(path).map_err(|e| {
                Error::configuration(format!("cannot open directory {}: {e}", path.display()))
            })?;
            Ok(Index::open_or_create(dir, schema)?)
        }
        BackendKind::Ram => Ok(Index::create_in_ram(schema)),
    }
}

/// Whether a file name participates in snapshot manifests.
///
/// Hidden files are engine or instance bookkeeping (writer locks, managed
/// file lists, our own lock file) and are neither shipped nor deleted by
/// replication.
pub fn is_replicable_file(name: &str) -> bool {
    !name.starts_with('.')
}

/// A locally held file with its manifest identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// File name relative to its namespace directory
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// CRC32 over the content
    pub checksum: u32,
}

/// Compute the CRC32 of a file's content
pub fn file_checksum(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 65536];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

/// Scan a namespace directory for its replicable files.
///
/// Missing directories scan as empty (a slave before its first sync).
pub fn scan_files(dir: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_replicable_file(&name) {
            continue;
        }
        let size = entry.metadata()?.len();
        let checksum = file_checksum(&path)?;
        files.push(LocalFile {
            name,
            size,
            checksum,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Write-back cache shared by the staged-download writers.
///
/// Buffers newly written segment bytes in memory until a file completes or
/// the cache fills, trading write latency for short-lived memory pressure.
#[derive(Debug, Clone)]
pub struct WriteCache {
    max_file_bytes: u64,
    max_total_bytes: u64,
    used: Arc<AtomicU64>,
}

impl WriteCache {
    /// Build the cache from index settings.
    ///
    /// Returns `None` when either threshold is zero: caching is disabled and
    /// the raw backend is used unwrapped.
    pub fn from_settings(settings: &IndexSettings) -> Option<Self> {
        let max_file_mb = settings
            .cache_max_merge_mb
            .unwrap_or(DEFAULT_CACHE_MAX_MERGE_MB);
        let max_total_mb = settings
            .cache_max_total_mb
            .unwrap_or(DEFAULT_CACHE_MAX_TOTAL_MB);
        if max_file_mb <= 0.0 || max_total_mb <= 0.0 {
            return None;
        }
        Some(Self {
            max_file_bytes: (max_file_mb * 1024.0 * 1024.0) as u64,
            max_total_bytes: (max_total_mb * 1024.0 * 1024.0) as u64,
            used: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Try to reserve buffer space for one file
    fn reserve(&self, size: u64) -> bool {
        if size > self.max_file_bytes {
            return false;
        }
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if current + size > self.max_total_bytes {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }

    /// Bytes currently buffered
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

enum StagedInner {
    Buffered {
        buf: Vec<u8>,
        cache: WriteCache,
        reserved: u64,
    },
    Direct {
        writer: BufWriter<File>,
    },
}

/// Incremental writer for one staged download.
///
/// Unfinished writers discard their partial output on drop; a staged file
/// only exists on disk once [`StagedWriter::finish`] returned.
pub struct StagedWriter {
    path: PathBuf,
    inner: Option<StagedInner>,
}

impl StagedWriter {
    /// Open a staged writer for a file of `expected_size` bytes
    pub fn create(path: &Path, expected_size: u64, cache: Option<&WriteCache>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let inner = match cache {
            Some(cache) if cache.reserve(expected_size) => StagedInner::Buffered {
                buf: Vec::with_capacity(expected_size as usize),
                cache: cache.clone(),
                reserved: expected_size,
            },
            _ => StagedInner::Direct {
                writer: BufWriter::new(File::create(path)?),
            },
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(inner),
        })
    }

    /// Append one downloaded chunk
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::internal("staged writer already finished"));
        };
        match inner {
            StagedInner::Buffered { buf, .. } => buf.extend_from_slice(data),
            StagedInner::Direct { writer } => writer.write_all(data)?,
        }
        Ok(())
    }

    /// Flush the staged file to disk
    pub fn finish(mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Err(Error::internal("staged writer already finished"));
        };
        match inner {
            StagedInner::Buffered {
                buf,
                cache,
                reserved,
            } => {
                let result = fs::write(&self.path, &buf);
                cache.release(reserved);
                result?;
            }
            StagedInner::Direct { mut writer } => {
                writer.flush()?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            }
        }
        Ok(())
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let StagedInner::Buffered {
                cache, reserved, ..
            } = inner
            {
                cache.release(reserved);
            }
            let _ = fs::remove_file(&self.path);
        }
    }
}
