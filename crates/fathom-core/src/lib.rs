//! Fathom Core - Multi-Tenant Search Index Server Engine
//!
//! This crate provides the index-server core for Fathom, implementing:
//! - Index instance lifecycle (build, serve, abort, close) over an embedded
//!   full-text engine
//! - Master/slave replication by consistent segment-file shipping
//! - A per-index read/write concurrency gate with bounded writer waits
//! - Snapshot-pinned, retained, timestamped backups
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Index Manager                   │
//! │   (multi-tenant registry, master locator)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │         Index Instance Builder               │
//! │   (common -> master | slave -> ready)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │  Writer/Searcher Pair   Replication  Backup │
//! │  (leases, refresh)      (manifest    (pin,  │
//! │                          diff, sync)  copy) │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Concurrency Gate · Directories · Engine   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The service layer (REST, query DSL, analyzers) lives above this crate
//! and consumes [`IndexManager`] / [`IndexInstance`]; the inverted-index
//! engine below it is tantivy, wrapped at the add/commit/snapshot/
//! file-enumeration boundary.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod builder;
pub mod directory;
pub mod document;
pub mod error;
pub mod gate;
pub mod instance;
pub mod manager;
pub mod mapping;
pub mod metadata;
pub mod pair;
pub mod query;
pub mod replication;
pub mod settings;
pub mod taxonomy;

pub use backup::{BackupEntry, BackupManager};
pub use builder::IndexInstanceBuilder;
pub use document::{Document, FieldValue};
pub use error::{Error, Result};
pub use gate::{GateLimits, Permit, ReadWriteGate};
pub use instance::{IndexInstance, IndexStatus};
pub use manager::IndexManager;
pub use mapping::{FieldKind, FieldMapping};
pub use metadata::IndexMetadata;
pub use pair::{SearcherLease, WriterAndSearcher};
pub use query::{SearchHit, SearchQuery, SearchResults};
pub use replication::{
    MasterEndpoint, MasterLocator, ReplicationLag, ReplicationMaster, ReplicationSlave,
    SnapshotManifest,
};
pub use settings::{BackendKind, IndexRole, IndexSettings, MergeScheduler, RemoteName};
