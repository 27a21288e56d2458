//! Per-index metadata record
//!
//! A small JSON record next to the index namespaces, read by the builder at
//! startup: the stable index UUID, the role the index was created with, and
//! - for slaves - the last master identity a successful sync was made
//! against.

use crate::settings::IndexRole;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Persisted identity of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Stable UUID assigned at creation
    pub uuid: Uuid,
    /// Role the index runs as
    pub role: IndexRole,
    /// Master UUID seen on the last successful sync (slaves only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_master_uuid: Option<Uuid>,
}

impl IndexMetadata {
    /// Fresh metadata for a newly created index
    pub fn create(role: IndexRole) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            role,
            last_master_uuid: None,
        }
    }

    /// Read the record, or `None` when the index was never created
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let metadata = serde_json::from_str(&raw)
            .map_err(|e| Error::configuration(format!("invalid metadata record: {e}")))?;
        Ok(Some(metadata))
    }

    /// Persist the record atomically (write-then-rename)
    pub fn store(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("metadata serialization failed: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");

        let mut metadata = IndexMetadata::create(IndexRole::Slave);
        metadata.last_master_uuid = Some(Uuid::new_v4());
        metadata.store(&path).unwrap();

        let loaded = IndexMetadata::load(&path).unwrap().unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(
            IndexMetadata::load(&dir.path().join("metadata.json"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_invalid_record_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            IndexMetadata::load(&path),
            Err(Error::Configuration(_))
        ));
    }
}
