//! Dispatcher integration tests
//!
//! Covers locking, node availability and the event-driven run loop.

mod common;

use std::time::Duration;

use common::{lock_options, Harness};
use sc_core::error::ConnectionErrorKind;
use sc_core::traits::RemoteHost;
use sc_worker::{LockCoordinator, PassOutcome};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_locked_node_is_skipped_without_side_effects() {
    let harness = Harness::new();
    let node = harness.fleet.add_node("edge", true);
    harness.fleet.add_deployment(&node, "web", "/srv/web", true);

    let other_worker = LockCoordinator::new(harness.locks.clone());
    let held = other_worker
        .acquire(node.id, lock_options())
        .await
        .unwrap()
        .expect("lock should be free");

    let outcome = harness.dispatcher.run_pass(node.id, true).await;
    assert!(matches!(outcome, PassOutcome::Skipped));
    assert_eq!(harness.connector.open_count(), 0);
    assert_eq!(harness.host(&node).write_count(), 0);

    held.release().await.unwrap();
    let outcome = harness.dispatcher.run_pass(node.id, true).await;
    assert!(matches!(outcome, PassOutcome::Completed(_)));
    assert!(!harness.locks.is_held(&LockCoordinator::key(node.id)));
}

#[tokio::test]
async fn test_unreachable_node_is_marked_failed() {
    let harness = Harness::new();
    let node = harness.fleet.add_node("edge", true);
    let target = harness.fleet.add_deployment(&node, "web", "/srv/web", true);
    harness
        .connector
        .fail_host(&node.host, ConnectionErrorKind::ConnectionRefused);

    let outcome = harness.dispatcher.run_pass(node.id, true).await;
    assert!(matches!(outcome, PassOutcome::Unreachable));

    let stored = harness.fleet.store.node(node.id).unwrap();
    assert!(stored.reconciliation_failed);
    assert!(stored.last_check.is_some());

    // Deployment status is untouched when the node cannot be reached
    let deployment = harness.fleet.store.deployment(target.deployment.id).unwrap();
    assert!(deployment.last_check.is_none());
    assert!(harness
        .fleet
        .store
        .connection_logs()
        .iter()
        .any(|l| l.error_kind == Some(ConnectionErrorKind::ConnectionRefused)));
}

#[tokio::test]
async fn test_disabled_node_drops_session() {
    let harness = Harness::new();
    let node = harness.fleet.add_node("edge", true);
    harness.fleet.add_deployment(&node, "web", "/srv/web", true);

    harness.dispatcher.run_pass(node.id, true).await;
    assert!(harness.pool.is_connected(node.id));

    harness.fleet.store.set_node_enabled(node.id, false).unwrap();
    let outcome = harness.dispatcher.run_pass(node.id, true).await;
    assert!(matches!(outcome, PassOutcome::NodeUnavailable));
    assert!(!harness.pool.is_connected(node.id));
}

#[tokio::test]
async fn test_deleted_node_is_unavailable() {
    let harness = Harness::new();
    let node = harness.fleet.add_node("edge", true);
    harness.fleet.store.remove_node(node.id);

    let outcome = harness.dispatcher.run_pass(node.id, true).await;
    assert!(matches!(outcome, PassOutcome::NodeUnavailable));
}

#[tokio::test]
async fn test_sweep_covers_enabled_nodes() {
    let harness = Harness::new();
    let a = harness.fleet.add_node("a", true);
    let b = harness.fleet.add_node("b", true);
    let off = harness.fleet.add_node("off", false);
    for node in [&a, &b, &off] {
        harness.fleet.add_deployment(node, "web", "/srv/web", true);
    }

    let outcomes = harness.dispatcher.sweep().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| matches!(outcome, PassOutcome::Completed(_))));
    assert!(harness.host(&a).file("/srv/web/docker-compose.yml").is_some());
    assert!(harness.host(&b).file("/srv/web/docker-compose.yml").is_some());
    assert!(harness.host(&off).file("/srv/web/docker-compose.yml").is_none());
}

#[tokio::test]
async fn test_run_reacts_to_node_updates() {
    let harness = Harness::new();
    let node = harness.fleet.add_node("edge", true);
    let target = harness.fleet.add_deployment(&node, "web", "/srv/web", true);
    let host = harness.host(&node);
    let path = target.version.compose_path();

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(harness.dispatcher.clone().run(cancel.clone()));

    // Startup sweep
    timeout(Duration::from_secs(5), async {
        while host.file(&path).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("startup sweep did not reconcile the node");

    let next = harness
        .fleet
        .publish_version(&target, "services:\n  web:\n    image: caddy:2\n");

    timeout(Duration::from_secs(5), async {
        while host.file(&path).as_deref() != Some(next.content.as_bytes()) {
            harness.events.publish_raw("definitely-not-a-node-id");
            harness.dispatcher.notify_node_changed(node.id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node update did not trigger a pass");

    cancel.cancel();
    timeout(Duration::from_secs(5), worker)
        .await
        .expect("dispatcher did not stop")
        .unwrap();

    assert!(harness.pool.is_empty());
    assert_eq!(host.state(), sc_core::SessionState::Disconnected);
}
