//! State polling against a fake node: convergence, the attempt ceiling, transport
//! failures and resumption after a restart.

mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use chrono::Utc;
use common::{FakeNode, closed_port, instance};
use serde_json::json;
use skyport_control::{
    config::PollConfig,
    node_client::NodeClient,
    reconcile::{RECONCILIATIONS_KEY, ReconcileOutcome, ReconcileTask, Reconciler, reconcile_key},
    registry::Registry,
};
use skyport_db::MemoryKv;
use skyport_model::InternalState;

fn fast_poll() -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(2),
        max_attempts: 50,
    }
}

fn reconciler(config: PollConfig) -> (Registry, Reconciler) {
    let registry = Registry::new(Arc::new(MemoryKv::new()));
    let client = NodeClient::new(Duration::from_secs(2)).unwrap();
    (registry.clone(), Reconciler::new(registry, client, config))
}

#[tokio::test]
async fn stops_polling_once_ready() {
    let node = FakeNode::start().await;
    node.state.script_states(&["INSTALLING", "INSTALLING", "READY"]);
    let (registry, reconciler) = reconciler(fast_poll());
    registry.put_instance(&instance(&node, "r1", "u1")).await.unwrap();

    let outcome = reconciler.run("r1").await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Ready);
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 3);
    let stored = registry.require_instance("r1").await.unwrap();
    assert_eq!(stored.internal_state, InternalState::Ready);
    assert!(reconciler.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_report_is_terminal() {
    let node = FakeNode::start().await;
    node.state.script_states(&["INSTALLING", "FAILED"]);
    let (registry, reconciler) = reconciler(fast_poll());
    registry.put_instance(&instance(&node, "r2", "u1")).await.unwrap();

    let outcome = reconciler.run("r2").await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 2);
    assert_eq!(
        registry.require_instance("r2").await.unwrap().internal_state,
        InternalState::Failed
    );
}

#[tokio::test]
async fn reported_container_id_replaces_stored_one() {
    let node = FakeNode::start().await;
    node.state
        .state_script
        .lock()
        .unwrap()
        .push_back((200, json!({ "state": "READY", "containerId": "ctr-fresh" })));
    let (registry, reconciler) = reconciler(fast_poll());
    registry.put_instance(&instance(&node, "r3", "u1")).await.unwrap();

    reconciler.run("r3").await.unwrap();

    assert_eq!(registry.require_instance("r3").await.unwrap().container_id, "ctr-fresh");
}

#[tokio::test]
async fn gives_up_after_fifty_rejected_polls() {
    let node = FakeNode::start().await;
    node.state.set_state_default(500, json!({ "error": "docker daemon unavailable" }));
    let (registry, reconciler) = reconciler(fast_poll());
    registry.put_instance(&instance(&node, "r4", "u1")).await.unwrap();

    let outcome = reconciler.run("r4").await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 50);
    assert_eq!(
        registry.require_instance("r4").await.unwrap().internal_state,
        InternalState::Failed
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn unreachable_node_fails_immediately() {
    let node = FakeNode::start().await;
    let (registry, reconciler) = reconciler(fast_poll());
    let mut inst = instance(&node, "r5", "u1");
    inst.node.port = closed_port().await;
    registry.put_instance(&inst).await.unwrap();

    let outcome = reconciler.run("r5").await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert_eq!(
        registry.require_instance("r5").await.unwrap().internal_state,
        InternalState::Failed
    );
}

#[tokio::test]
async fn deleted_instance_ends_the_run() {
    let (_, reconciler) = reconciler(fast_poll());
    assert_eq!(reconciler.run("missing").await.unwrap(), ReconcileOutcome::InstanceGone);
}

#[tokio::test]
async fn resume_continues_from_the_persisted_attempt_count() {
    let node = FakeNode::start().await;
    node.state.set_state_default(500, json!({ "error": "still broken" }));
    let (registry, reconciler) = reconciler(fast_poll());
    registry.put_instance(&instance(&node, "r6", "u1")).await.unwrap();

    registry
        .set_json(
            &reconcile_key("r6"),
            &ReconcileTask {
                instance_id: "r6".to_string(),
                attempts: 48,
                started_at: Utc::now(),
                last_poll_at: None,
            },
        )
        .await
        .unwrap();
    registry.add_id(RECONCILIATIONS_KEY, "r6").await.unwrap();

    assert_eq!(reconciler.resume().await.unwrap(), 1);
    let watcher = reconciler.clone();
    let finished = common::eventually(move || {
        let watcher = watcher.clone();
        async move { watcher.list().await.unwrap().is_empty() }
    })
    .await;

    assert!(finished);
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 2);
    assert_eq!(
        registry.require_instance("r6").await.unwrap().internal_state,
        InternalState::Failed
    );
}

#[tokio::test]
async fn cancel_stops_a_tracked_task() {
    let node = FakeNode::start().await;
    let (registry, reconciler) = reconciler(PollConfig {
        interval: Duration::from_secs(3600),
        max_attempts: 50,
    });
    registry.put_instance(&instance(&node, "r7", "u1")).await.unwrap();

    reconciler.track("r7").await.unwrap();
    assert!(reconciler.is_running("r7").await);
    assert_eq!(reconciler.list().await.unwrap().len(), 1);

    assert!(reconciler.cancel("r7").await.unwrap());
    assert!(!reconciler.is_running("r7").await);
    assert!(reconciler.list().await.unwrap().is_empty());
    assert!(registry.get_json::<ReconcileTask>(&reconcile_key("r7")).await.unwrap().is_none());
    assert_eq!(node.state.state_polls.load(Ordering::SeqCst), 0);
}
