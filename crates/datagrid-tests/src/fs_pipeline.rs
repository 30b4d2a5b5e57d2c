//! Cross-protocol pipelines over a real filesystem backend.

use std::sync::Arc;

use bytes::Bytes;

use datagrid_adapters::fs::SshFileAdapter;
use datagrid_adapters::object::ObjectStoreAdapter;
use datagrid_adapters::{ObjectKey, StorageAdapter};
use datagrid_core::did::Did;
use datagrid_core::rule::RuleState;
use datagrid_core::site::{ProtocolKind, SiteRecord};

use crate::harness::Grid;

#[tokio::test]
async fn test_object_store_to_posix_copy() {
    let dir = tempfile::tempdir().unwrap();
    let src = Arc::new(ObjectStoreAdapter::new(1 << 30));
    let dst = Arc::new(SshFileAdapter::new(dir.path()));
    let grid = Grid::new(vec![
        (
            SiteRecord::new("site-obj", ProtocolKind::ObjectStore, 1 << 30),
            src as Arc<dyn StorageAdapter>,
        ),
        (
            SiteRecord::new("site-posix", ProtocolKind::SshFile, 1 << 30),
            dst.clone() as Arc<dyn StorageAdapter>,
        ),
    ])
    .unwrap();

    let did = grid.seed_file("f1", b"posix payload", "site-obj").await.unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();
    assert_eq!(
        grid.converge(rule_id, 1_000).await.unwrap(),
        RuleState::Satisfied
    );

    let on_disk = std::fs::read(dir.path().join("test").join("f1")).unwrap();
    assert_eq!(on_disk, b"posix payload");
    // The staging partial was promoted away.
    assert!(dst.list_partials().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reaper_sweeps_stranded_partial_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(SshFileAdapter::new(dir.path()));
    let grid = Grid::new(vec![(
        SiteRecord::new("site-posix", ProtocolKind::SshFile, 1 << 30),
        adapter.clone() as Arc<dyn StorageAdapter>,
    )])
    .unwrap();

    let did = Did::new("test", "f1").unwrap();
    let partial = ObjectKey::for_did(&did).partial_of();
    adapter
        .stage_in(&partial, Bytes::from_static(b"half a file"))
        .await
        .unwrap();
    assert!(dir.path().join("test").join("f1.part").exists());

    let stats = grid.reaper.sweep(10_000).await.unwrap();
    assert_eq!(stats.orphans, 1);
    assert!(!dir.path().join("test").join("f1.part").exists());
}
