//! Index manager
//!
//! The multi-tenant registry mapping logical index names to live
//! instances. Creates indexes, re-opens them at startup from their
//! persisted settings, closes and deletes them, and acts as the in-process
//! master locator wiring slaves to masters under the same schema. A
//! locator for remote schemas can be plugged in for cross-server
//! replication.

use crate::builder::IndexInstanceBuilder;
use crate::directory::IndexPaths;
use crate::gate::ReadWriteGate;
use crate::instance::IndexInstance;
use crate::replication::{MasterEndpoint, MasterLocator};
use crate::settings::{IndexRole, IndexSettings, RemoteName};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-index settings record persisted next to the metadata
const SETTINGS_FILE: &str = "settings.json";

/// Multi-tenant index registry for one schema
pub struct IndexManager {
    schema_name: String,
    root: PathBuf,
    gate: Arc<ReadWriteGate>,
    indexes: DashMap<String, Arc<IndexInstance>>,
    remote_locator: Mutex<Option<Arc<dyn MasterLocator>>>,
}

impl IndexManager {
    /// Manager for `schema_name`, storing its indexes under `root`
    pub fn new(schema_name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Arc::new(Self {
            schema_name: schema_name.into(),
            root,
            gate: Arc::new(ReadWriteGate::new()),
            indexes: DashMap::new(),
            remote_locator: Mutex::new(None),
        }))
    }

    /// Schema (tenant namespace) this manager serves
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// The shared concurrency gate
    pub fn gate(&self) -> &Arc<ReadWriteGate> {
        &self.gate
    }

    /// Install a locator for masters living under other schemas
    pub fn set_remote_locator(&self, locator: Arc<dyn MasterLocator>) {
        *self.remote_locator.lock() = Some(locator);
    }

    /// Create an index (or open an existing directory) under this schema
    pub fn create_index(
        self: &Arc<Self>,
        name: &str,
        settings: IndexSettings,
    ) -> Result<Arc<IndexInstance>> {
        validate_index_name(name)?;
        if self.indexes.contains_key(name) {
            return Err(Error::configuration(format!(
                "index '{name}' is already open"
            )));
        }
        let instance = self.build_instance(name, settings)?;
        self.indexes.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Re-open every index with a persisted settings record under the
    /// root. Returns the number of indexes opened.
    pub fn open_all(self: &Arc<Self>) -> Result<usize> {
        let mut opened = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.indexes.contains_key(&name) {
                continue;
            }
            let settings_path = entry.path().join(SETTINGS_FILE);
            if !settings_path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&settings_path)?;
            let settings: IndexSettings = serde_json::from_str(&raw).map_err(|e| {
                Error::configuration(format!("invalid settings record for '{name}': {e}"))
            })?;
            let instance = self.build_instance(&name, settings)?;
            self.indexes.insert(name, instance);
            opened += 1;
        }
        Ok(opened)
    }

    fn build_instance(
        self: &Arc<Self>,
        name: &str,
        settings: IndexSettings,
    ) -> Result<Arc<IndexInstance>> {
        let paths = IndexPaths::at(self.root.join(name));
        let locator: Arc<dyn MasterLocator> = self.clone();
        let instance = Arc::new(
            IndexInstanceBuilder::new(name, paths, settings.clone(), self.gate.clone(), locator)
                .build()?,
        );

        let raw = serde_json::to_string_pretty(&settings)
            .map_err(|e| Error::internal(format!("settings serialization: {e}")))?;
        fs::write(self.root.join(name).join(SETTINGS_FILE), raw)?;

        if instance.role() == IndexRole::Slave {
            if let Some(interval_ms) = settings.sync_interval_ms {
                instance.start_sync_worker(Duration::from_millis(interval_ms))?;
            }
        }
        Ok(instance)
    }

    /// Look up a live index
    pub fn get(&self, name: &str) -> Result<Arc<IndexInstance>> {
        self.indexes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("unknown index: {name}")))
    }

    /// Names of every live index, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Close an index, releasing its writer and directory lock
    pub fn close(&self, name: &str) -> Result<()> {
        let (_, instance) = self
            .indexes
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("unknown index: {name}")))?;
        instance.stop_sync_worker();
        drop(instance);
        Ok(())
    }

    /// Close an index and delete its directory tree
    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.close(name)?;
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        tracing::info!(schema = %self.schema_name, index = name, "index deleted");
        Ok(())
    }
}

impl MasterLocator for IndexManager {
    fn locate(&self, remote: &RemoteName) -> Result<Arc<dyn MasterEndpoint>> {
        let (Some(schema), Some(index)) = (&remote.schema, &remote.index) else {
            return Err(Error::configuration("incomplete remote master name"));
        };
        if *schema != self.schema_name {
            if let Some(fallback) = self.remote_locator.lock().clone() {
                return fallback.locate(remote);
            }
            return Err(Error::not_found(format!("unknown schema: {schema}")));
        }
        let instance = self.get(index)?;
        instance
            .replication_master()
            .map(|master| master as Arc<dyn MasterEndpoint>)
            .ok_or_else(|| {
                Error::configuration(format!("index '{index}' is not a replication master"))
            })
    }
}

fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name == "_all"
    {
        return Err(Error::configuration(format!("invalid index name: '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::mapping::{FieldKind, FieldMapping};
    use crate::query::SearchQuery;
    use tempfile::TempDir;

    fn mapping() -> FieldMapping {
        FieldMapping::new().field("title", FieldKind::text())
    }

    #[test]
    fn test_create_get_close() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();

        let created = manager
            .create_index("products", IndexSettings::master(mapping()))
            .unwrap();
        assert_eq!(manager.list(), vec!["products"]);
        assert_eq!(manager.get("products").unwrap().uuid(), created.uuid());

        manager.close("products").unwrap();
        assert!(manager.get("products").is_err());
    }

    #[test]
    fn test_double_create_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        manager
            .create_index("products", IndexSettings::master(mapping()))
            .unwrap();
        assert!(matches!(
            manager.create_index("products", IndexSettings::master(mapping())),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        for bad in ["", ".hidden", "a/b", "a\\b"] {
            assert!(manager
                .create_index(bad, IndexSettings::master(mapping()))
                .is_err());
        }
    }

    #[test]
    fn test_open_all_restores_indexes() {
        let dir = TempDir::new().unwrap();
        let uuid = {
            let manager = IndexManager::new("tenants", dir.path()).unwrap();
            let instance = manager
                .create_index("products", IndexSettings::master(mapping()))
                .unwrap();
            instance
                .post_documents(&[Document::new("1").text("title", "walnut desk")])
                .unwrap();
            instance.commit().unwrap();
            let uuid = instance.uuid();
            drop(instance);
            manager.close("products").unwrap();
            uuid
        };

        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        assert_eq!(manager.open_all().unwrap(), 1);
        let instance = manager.get("products").unwrap();
        assert_eq!(instance.uuid(), uuid);
        assert_eq!(instance.count(&SearchQuery::All).unwrap(), 1);
    }

    #[test]
    fn test_delete_index_removes_directory() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        let instance = manager
            .create_index("products", IndexSettings::master(mapping()))
            .unwrap();
        drop(instance);

        manager.delete_index("products").unwrap();
        assert!(!dir.path().join("products").exists());
        assert!(manager.get("products").is_err());
    }

    #[test]
    fn test_locate_resolves_local_master() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        manager
            .create_index("products", IndexSettings::master(mapping()))
            .unwrap();

        let endpoint = manager
            .locate(&RemoteName::of("tenants", "products"))
            .unwrap();
        assert!(endpoint.master_uuid().is_ok());

        assert!(manager.locate(&RemoteName::of("other", "products")).is_err());
        assert!(manager.locate(&RemoteName::of("tenants", "missing")).is_err());
    }

    #[test]
    fn test_locate_rejects_slave_target() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new("tenants", dir.path()).unwrap();
        manager
            .create_index("products", IndexSettings::master(mapping()))
            .unwrap();
        manager
            .create_index(
                "follower",
                IndexSettings::slave(mapping(), RemoteName::of("tenants", "products")),
            )
            .unwrap();

        assert!(matches!(
            manager.locate(&RemoteName::of("tenants", "follower")),
            Err(Error::Configuration(_))
        ));
    }
}
