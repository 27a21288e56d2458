//! Backup create/list/purge/restore over live engine indexes

use anyhow::Result;
use fathom_core::directory::IndexPaths;
use fathom_core::{
    Document, FieldKind, FieldMapping, IndexManager, IndexSettings, RemoteName, SearchQuery,
};
use std::sync::Arc;
use tempfile::TempDir;

fn mapping() -> FieldMapping {
    FieldMapping::new()
        .field("title", FieldKind::text())
        .field("sku", FieldKind::keyword())
}

fn doc(id: &str, title: &str) -> Document {
    Document::new(id).text("title", title).text("sku", id)
}

fn manager(dir: &TempDir) -> Arc<IndexManager> {
    IndexManager::new("tenants", dir.path()).unwrap()
}

#[test]
fn backup_restores_to_point_in_time() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("products", IndexSettings::master(mapping()))?;
    master.post_documents(&[
        doc("1", "walnut desk"),
        doc("2", "oak chair"),
        doc("3", "pine shelf"),
        doc("4", "birch table"),
    ])?;
    master.commit()?;

    // Backup taken before the fifth document
    let entry = master.create_backup()?;
    assert_eq!(master.status().held_snapshots, 0);

    master.post_documents(&[doc("5", "maple stool")])?;
    master.commit()?;
    assert_eq!(master.count(&SearchQuery::All)?, 5);

    // A slave synced now sees all 5
    let slave = manager.create_index(
        "follower",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "products")),
    )?;
    slave.sync()?;
    assert_eq!(slave.count(&SearchQuery::All)?, 5);

    // The pre-5th backup still restores to 4 documents
    let restore_root = dir.path().join("restored-layout");
    master.restore_backup(entry.created_at, &IndexPaths::at(&restore_root))?;
    drop(master);
    drop(slave);

    let restored_manager = IndexManager::new("restored", dir.path().join("restored-root"))?;
    // Open an instance directly over the restored file set
    let restored = fathom_core::IndexInstanceBuilder::new(
        "restored",
        IndexPaths::at(&restore_root),
        IndexSettings::master(mapping()),
        restored_manager.gate().clone(),
        restored_manager.clone(),
    )
    .build()?;
    assert_eq!(restored.count(&SearchQuery::All)?, 4);
    assert_eq!(restored.count(&SearchQuery::parse("maple"))?, 0);
    Ok(())
}

#[test]
fn successive_backups_are_content_equal() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("products", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    assert!(master.list_backups()?.is_empty());

    let first = master.create_backup()?;
    let second = master.create_backup()?;

    // Distinct entries, identical content
    assert_ne!(first.created_at, second.created_at);
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.file_count, second.file_count);

    let listed = master.list_backups()?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0], second, "newest first");
    assert_eq!(listed[1], first);
    Ok(())
}

#[test]
fn purge_removes_exactly_the_oldest() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("products", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    let oldest = master.create_backup()?;
    let middle = master.create_backup()?;
    let newest = master.create_backup()?;

    let removed = master.purge_backups(2)?;
    assert_eq!(removed, 1);
    assert!(!oldest.location.exists());
    assert_eq!(master.list_backups()?, vec![newest, middle]);

    // keep >= count is a no-op
    assert_eq!(master.purge_backups(2)?, 0);
    assert_eq!(master.purge_backups(10)?, 0);
    assert_eq!(master.list_backups()?.len(), 2);
    Ok(())
}

#[test]
fn backups_are_master_only() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    manager.create_index("products", IndexSettings::master(mapping()))?;
    let slave = manager.create_index(
        "follower",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "products")),
    )?;

    assert!(slave.create_backup().is_err());
    assert!(slave.list_backups().is_err());
    Ok(())
}
