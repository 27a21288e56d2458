//! Error types for Fathom Core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Fathom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Fathom index server
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed settings; fatal at build time, the instance never reaches READY
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors from directory or file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors surfaced by the embedded index engine
    #[error("Engine error: {0}")]
    Engine(#[from] tantivy::TantivyError),

    /// Query resolution errors
    #[error("Query error: {0}")]
    Query(String),

    /// Network/read failure during a sync cycle; recovered by retry on the
    /// next cycle, never corrupts local state
    #[error("Transient replication error: {0}")]
    TransientReplication(String),

    /// The master's backing data was replaced; recovered by a full resync
    #[error("Master identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// UUID seen on previous sync cycles
        expected: Uuid,
        /// UUID the master reports now
        actual: Uuid,
    },

    /// Permit acquisition timed out
    #[error("Concurrency unavailable: {0}")]
    ConcurrencyUnavailable(String),

    /// Checksum mismatch persisting across retries
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Unknown index, generation, or manifest file
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a transient replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::TransientReplication(msg.into())
    }

    /// Create a concurrency-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ConcurrencyUnavailable(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error is recoverable by retrying on the next sync cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientReplication(_) | Self::IdentityMismatch { .. }
        )
    }
}
