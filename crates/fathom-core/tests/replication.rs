//! End-to-end master/slave replication over live engine indexes

use anyhow::Result;
use fathom_core::{
    Document, FieldKind, FieldMapping, IndexManager, IndexRole, IndexSettings, RemoteName,
    SearchQuery,
};
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mapping() -> FieldMapping {
    FieldMapping::new()
        .field("title", FieldKind::text())
        .field("sku", FieldKind::keyword())
}

fn doc(id: &str, title: &str) -> Document {
    Document::new(id).text("title", title).text("sku", id)
}

fn manager(dir: &TempDir) -> Arc<IndexManager> {
    init_tracing();
    IndexManager::new("tenants", dir.path()).unwrap()
}

#[test]
fn master_slave_convergence_scenario() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    // Index A as master: add 4 documents, commit, query returns 4 hits
    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[
        doc("1", "walnut desk"),
        doc("2", "oak chair"),
        doc("3", "pine shelf"),
        doc("4", "birch table"),
    ])?;
    master.commit()?;
    assert_eq!(master.count(&SearchQuery::All)?, 4);

    // Index B as slave of A: after a sync it returns 4 hits too
    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;
    assert_eq!(slave.role(), IndexRole::Slave);
    let report = slave.sync()?;
    assert!(report.changed);
    assert_eq!(slave.count(&SearchQuery::All)?, 4);

    // One more document on A; B converges to 5 on the next sync
    master.post_documents(&[doc("5", "maple stool")])?;
    master.commit()?;
    slave.sync()?;
    assert_eq!(slave.count(&SearchQuery::All)?, 5);
    assert_eq!(slave.count(&SearchQuery::parse("maple"))?, 1);

    // No outstanding snapshot holds on the master
    assert_eq!(master.status().held_snapshots, 0);
    Ok(())
}

#[test]
fn sync_is_idempotent_without_master_writes() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;

    let first = slave.sync()?;
    assert!(first.changed);

    let second = slave.sync()?;
    assert!(!second.changed);
    assert_eq!(second.files_fetched, 0);
    assert_eq!(second.generation, first.generation);
    assert_eq!(slave.count(&SearchQuery::All)?, 1);

    let lag = slave.replication_lag().expect("slave reports lag");
    assert_eq!(lag.behind(), 0);
    Ok(())
}

#[test]
fn snapshot_isolation_across_sync() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;
    slave.sync()?;

    // A reader holding a pre-sync snapshot keeps returning pre-sync results
    let lease = slave.acquire_searcher()?;
    assert_eq!(lease.searcher().num_docs(), 1);

    master.post_documents(&[doc("2", "oak chair"), doc("3", "pine shelf")])?;
    master.commit()?;
    slave.sync()?;

    assert_eq!(lease.searcher().num_docs(), 1);
    assert_eq!(slave.count(&SearchQuery::All)?, 3);
    lease.release();
    Ok(())
}

#[test]
fn master_replacement_forces_full_resync() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk"), doc("2", "oak chair")])?;
    master.commit()?;

    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;
    slave.sync()?;
    assert_eq!(slave.count(&SearchQuery::All)?, 2);
    drop(master);

    // Replace the master's backing data entirely: new index, new UUID
    manager.delete_index("index-a")?;
    let replacement = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    replacement.post_documents(&[doc("9", "brass lamp")])?;
    replacement.commit()?;

    let report = slave.sync()?;
    assert!(report.full_sync);
    assert_eq!(slave.count(&SearchQuery::All)?, 1);
    assert_eq!(slave.count(&SearchQuery::parse("brass"))?, 1);
    assert_eq!(slave.count(&SearchQuery::parse("walnut"))?, 0);
    Ok(())
}

#[test]
fn slave_survives_unreachable_master() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;
    slave.sync()?;
    drop(master);
    manager.close("index-a")?;

    // The master is gone; the sync cycle fails but the slave keeps serving
    // its last synced generation
    assert!(slave.sync().is_err());
    assert_eq!(slave.count(&SearchQuery::All)?, 1);
    Ok(())
}

#[test]
fn slave_rejects_local_writes() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    manager.create_index("index-a", IndexSettings::master(mapping()))?;
    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a")),
    )?;

    assert!(slave.post_documents(&[doc("1", "nope")]).is_err());
    assert!(slave.commit().is_err());
    Ok(())
}

#[test]
fn periodic_sync_worker_converges_without_manual_syncs() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);

    let master = manager.create_index("index-a", IndexSettings::master(mapping()))?;
    master.post_documents(&[doc("1", "walnut desk")])?;
    master.commit()?;

    let slave_settings = IndexSettings::slave(mapping(), RemoteName::of("tenants", "index-a"))
        .with_sync_interval(std::time::Duration::from_millis(100));
    let slave = manager.create_index("index-b", slave_settings)?;

    // The worker has to catch up on its own
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while slave.count(&SearchQuery::All)? < 1 {
        assert!(std::time::Instant::now() < deadline, "worker never synced");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert_eq!(slave.count(&SearchQuery::All)?, 1);

    master.post_documents(&[doc("2", "oak chair")])?;
    master.commit()?;
    while slave.count(&SearchQuery::All)? < 2 {
        assert!(std::time::Instant::now() < deadline, "worker never caught up");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    // Closing the slave stops the worker cleanly
    drop(slave);
    manager.close("index-b")?;
    Ok(())
}

#[test]
fn faceted_index_ships_taxonomy_namespace() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = manager(&dir);
    let faceted = mapping().field("category", FieldKind::facet());

    let master = manager.create_index("index-a", IndexSettings::master(faceted.clone()))?;
    master.post_documents(&[
        Document::new("1")
            .text("title", "walnut desk")
            .text("sku", "1")
            .text("category", "/furniture/desks"),
    ])?;
    master.commit()?;
    assert!(master.has_taxonomy());

    let slave = manager.create_index(
        "index-b",
        IndexSettings::slave(faceted, RemoteName::of("tenants", "index-a")),
    )?;
    slave.sync()?;

    assert_eq!(slave.count(&SearchQuery::All)?, 1);

    // The taxonomy namespace came across byte-identical to the master's
    let master_taxo = fathom_core::directory::scan_files(&master.paths().taxonomy)?;
    let slave_taxo = fathom_core::directory::scan_files(&slave.paths().taxonomy)?;
    assert_eq!(master_taxo, slave_taxo);
    assert!(!master_taxo.is_empty());
    Ok(())
}
