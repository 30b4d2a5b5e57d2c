//! End-to-end pipeline tests: rule in, replicas out.

use datagrid_adapters::{ObjectKey, StorageAdapter};
use datagrid_core::did::Did;
use datagrid_core::replica::ReplicaState;
use datagrid_core::rule::{Rule, RuleState, SiteFilter};
use datagrid_core::site::SiteId;
use datagrid_core::transfer::TransferState;
use datagrid_events::Event;
use datagrid_store::StateStore;

use crate::harness::Grid;

#[tokio::test]
async fn test_two_copy_rule_converges_to_satisfied() {
    let (grid, adapters) = Grid::object_sites(&["site-a", "site-b", "site-c"]).unwrap();
    let did = grid.seed_file("f1", b"payload-one", "site-a").await.unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();

    let state = grid.converge(rule_id, 1_000).await.unwrap();
    assert_eq!(state, RuleState::Satisfied);

    let replicas = grid.store.list_replicas(&did).await.unwrap();
    let available: Vec<_> = replicas
        .iter()
        .filter(|r| r.state == ReplicaState::Available)
        .collect();
    assert_eq!(available.len(), 2);
    // Every counted replica is pinned by the rule.
    assert!(available.iter().all(|r| r.lock_cnt == 1));

    let dest = available
        .iter()
        .find(|r| r.site != SiteId::new("site-a"))
        .unwrap();
    let data = adapters[dest.site.as_str()]
        .stage_out(&ObjectKey::for_did(&did))
        .await
        .unwrap();
    assert_eq!(&data[..], b"payload-one");

    let events = grid.sink.events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ReplicaCreated { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RuleSatisfied { rule_id: id, .. } if *id == rule_id)));
}

#[tokio::test]
async fn test_lost_replica_is_repaired() {
    let (grid, _adapters) = Grid::object_sites(&["site-a", "site-b", "site-c"]).unwrap();
    let did = grid.seed_file("f1", b"payload", "site-a").await.unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();
    assert_eq!(
        grid.converge(rule_id, 1_000).await.unwrap(),
        RuleState::Satisfied
    );

    // The new copy goes dark.
    let dest = grid
        .store
        .list_replicas(&did)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.site != SiteId::new("site-a"))
        .unwrap();
    let site = dest.site.clone();
    let mut lost = dest;
    lost.state = ReplicaState::Unavailable;
    grid.store.update_replica(lost, 50_000).await.unwrap();

    assert_eq!(
        grid.converge(rule_id, 60_000).await.unwrap(),
        RuleState::Satisfied
    );
    assert_eq!(grid.available_replicas(&did).await.unwrap(), 2);
    // The stale pin on the lost copy was dropped during re-evaluation.
    let replicas = grid.store.list_replicas(&did).await.unwrap();
    for replica in replicas {
        if replica.site == site && replica.state == ReplicaState::Unavailable {
            assert_eq!(replica.lock_cnt, 0);
        }
    }
}

#[tokio::test]
async fn test_expired_rule_unlocks_and_reaper_reclaims() {
    let (grid, adapters) = Grid::object_sites(&["site-a", "site-b"]).unwrap();
    let did = grid.seed_file("f1", b"payload", "site-a").await.unwrap();
    let rule = Rule::new(did.clone(), 2, SiteFilter::Any, 100).with_expiry(5_000);
    grid.store.put_rule(rule.clone()).await.unwrap();
    assert_eq!(
        grid.converge(rule.id, 1_000).await.unwrap(),
        RuleState::Satisfied
    );

    let outcome = grid.engine.evaluate(rule.id, 10_000).await.unwrap();
    assert_eq!(outcome.state, RuleState::Expired);

    // Both copies are tombstoned now; past the grace they are deleted.
    let stats = grid.reaper.sweep(20_000).await.unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.errors, 0);
    assert!(grid.store.list_replicas(&did).await.unwrap().is_empty());
    for adapter in adapters.values() {
        assert_eq!(adapter.object_count(), 0);
    }
    let catalog = grid.catalog.read().await;
    for site in ["site-a", "site-b"] {
        let record = catalog.lookup(&SiteId::new(site)).unwrap();
        assert_eq!(record.replica_count, 0);
    }
}

#[tokio::test]
async fn test_permanent_failure_sets_cooldown_and_stuck() {
    let (grid, _adapters) = Grid::object_sites(&["site-a", "site-b"]).unwrap();
    // Replica row claims the object is at site-a, but nothing was staged,
    // so every copy attempt fails permanently.
    let did = Did::new("test", "f1").unwrap();
    grid.store
        .register_file(datagrid_core::dataset::FileRecord::with_checksum(
            did.clone(),
            7,
            datagrid_core::checksum::Checksum::blake3_of(b"payload"),
        ))
        .await
        .unwrap();
    grid.store
        .create_replica(&did, &SiteId::new("site-a"), ReplicaState::Available, 100)
        .await
        .unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();

    let state = grid.converge(rule_id, 1_000).await.unwrap();
    assert_eq!(state, RuleState::Pending);

    let requests = grid.store.list_transfers_for_rule(rule_id).await.unwrap();
    assert!(requests.iter().any(|r| r.state == TransferState::Failed));
    // The failed destination is in cooldown and site-a is covered, so the
    // rule has nowhere left to go.
    let stored = grid.store.get_rule(rule_id).await.unwrap();
    assert!(stored
        .stuck_reason
        .as_deref()
        .unwrap()
        .contains("no eligible destination site"));
    let events = grid.sink.events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::TransferFailed { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::RuleStuck { .. })));
}
