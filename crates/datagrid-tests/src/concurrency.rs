//! Concurrency and load behavior of the evaluation/transfer loop.

use std::sync::Arc;

use datagrid_adapters::object::Fault;
use datagrid_core::replica::ReplicaState;
use datagrid_core::rule::RuleState;
use datagrid_core::site::SiteId;
use datagrid_core::transfer::TransferState;
use datagrid_store::StateStore;

use crate::harness::Grid;

#[tokio::test]
async fn test_concurrent_evaluations_create_one_request_set() {
    let (grid, _adapters) = Grid::object_sites(&["site-a", "site-b", "site-c"]).unwrap();
    let grid = Arc::new(grid);
    let did = grid.seed_file("f1", b"payload", "site-a").await.unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let grid = Arc::clone(&grid);
        handles.push(tokio::spawn(async move {
            grid.engine.evaluate(rule_id, 1_000).await
        }));
    }
    let mut created = 0;
    for handle in handles {
        created += handle.await.unwrap().unwrap().created.len();
    }

    // One destination short of the target, so exactly one request exists
    // no matter how many evaluations raced.
    assert_eq!(created, 1);
    let requests = grid.store.list_transfers_for_rule(rule_id).await.unwrap();
    assert_eq!(requests.len(), 1);
    // The racing passes pinned the counted replica exactly once.
    let replica = grid
        .store
        .get_replica(&did, &SiteId::new("site-a"))
        .await
        .unwrap();
    assert_eq!(replica.lock_cnt, 1);
}

#[tokio::test]
async fn test_many_rules_all_converge() {
    let (grid, _adapters) = Grid::object_sites(&["site-a", "site-b", "site-c", "site-d"]).unwrap();
    let mut rules = Vec::new();
    for i in 0..10 {
        let name = format!("f{i}");
        let did = grid
            .seed_file(&name, format!("payload-{i}").as_bytes(), "site-a")
            .await
            .unwrap();
        let rule_id = grid.add_rule(&did, 2).await.unwrap();
        rules.push((did, rule_id));
    }

    let mut now = 1_000;
    for _ in 0..12 {
        for (_, rule_id) in &rules {
            grid.engine.evaluate(*rule_id, now).await.unwrap();
        }
        grid.orchestrator.pump().await.unwrap();
        grid.orchestrator.run_once(now).await.unwrap();
        now += 1_000;
    }

    for (did, rule_id) in &rules {
        let outcome = grid.engine.evaluate(*rule_id, now).await.unwrap();
        assert_eq!(outcome.state, RuleState::Satisfied);
        assert_eq!(grid.available_replicas(did).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn test_transient_faults_resolved_within_convergence() {
    let (grid, adapters) = Grid::object_sites(&["site-a", "site-b"]).unwrap();
    let did = grid.seed_file("f1", b"payload", "site-a").await.unwrap();
    let rule_id = grid.add_rule(&did, 2).await.unwrap();

    for _ in 0..3 {
        adapters["site-a"].inject_fault(Fault::Timeout);
    }

    assert_eq!(
        grid.converge(rule_id, 1_000).await.unwrap(),
        RuleState::Satisfied
    );
    let request = grid
        .store
        .list_transfers_for_rule(rule_id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.state == TransferState::Done)
        .unwrap();
    assert_eq!(request.attempts, 4);
    assert_eq!(grid.available_replicas(&did).await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_rules_share_in_flight_transfer() {
    let (grid, _adapters) = Grid::object_sites(&["site-a", "site-b"]).unwrap();
    let did = grid.seed_file("f1", b"payload", "site-a").await.unwrap();
    let first = grid.add_rule(&did, 2).await.unwrap();
    let second = grid.add_rule(&did, 2).await.unwrap();

    // The first rule queues the copy; the second sees the live request
    // covering site-b and queues nothing.
    grid.engine.evaluate(first, 1_000).await.unwrap();
    let outcome = grid.engine.evaluate(second, 1_000).await.unwrap();
    assert!(outcome.created.is_empty());

    grid.orchestrator.pump().await.unwrap();
    grid.orchestrator.run_once(1_000).await.unwrap();

    assert_eq!(
        grid.engine.evaluate(first, 2_000).await.unwrap().state,
        RuleState::Satisfied
    );
    assert_eq!(
        grid.engine.evaluate(second, 2_000).await.unwrap().state,
        RuleState::Satisfied
    );
    // Both rules pin both replicas independently.
    let replica = grid
        .store
        .get_replica(&did, &SiteId::new("site-b"))
        .await
        .unwrap();
    assert_eq!(replica.state, ReplicaState::Available);
    assert_eq!(replica.lock_cnt, 2);
}
