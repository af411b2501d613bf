//! Replay buffer behaviour over simulated nodes

use std::sync::Arc;
use std::time::Duration;

use swarmfix_core::engine::{Event, EventKind, Node, NodeId, SettingsPack, TransferState};
use swarmfix_core::network::PortAllocator;
use swarmfix_core::{ConsumePolicy, InfoHash, ReplayRegistry};
use swarmfix_sim::{SimNode, SimSwarm};

fn quiet_node(swarm: &SimSwarm, name: &str) -> Arc<SimNode> {
    let node = swarm.spawn_node(name, false).unwrap();
    node.pop_events();
    node
}

fn script(node: &SimNode, info_hash: InfoHash) {
    node.inject_event(Event::transfer_added(info_hash));
    node.inject_event(Event::state_changed(
        info_hash,
        TransferState::CheckingFiles,
        TransferState::Downloading,
    ));
    node.inject_event(Event::transfer_finished(info_hash));
}

#[tokio::test(start_paused = true)]
async fn test_later_events_survive_pop_through_match() {
    let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
    let node = quiet_node(&swarm, "node1");
    let registry = ReplayRegistry::new(Duration::from_secs(5));
    let info_hash = InfoHash::new([1u8; 20]);
    script(&node, info_hash);

    let changed = registry
        .wait_for_event(node.as_ref(), EventKind::StateChanged, "node1", ConsumePolicy::PopThroughMatch)
        .await
        .unwrap();
    assert_eq!(changed.state(), Some(TransferState::Downloading));
    assert_eq!(registry.buffered(node.id()).await, 1);

    let finished = registry
        .wait_for_event(node.as_ref(), EventKind::TransferFinished, "node1", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(finished.is_some());
    assert_eq!(registry.buffered(node.id()).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pop_all_forgets_the_rest() {
    let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
    let node = quiet_node(&swarm, "node1");
    let registry = ReplayRegistry::new(Duration::from_secs(5));
    script(&node, InfoHash::new([2u8; 20]));

    assert!(
        registry
            .wait_for_event(node.as_ref(), EventKind::TransferAdded, "node1", ConsumePolicy::PopAll)
            .await
            .is_some()
    );

    let started = tokio::time::Instant::now();
    let finished = registry
        .wait_for_event(node.as_ref(), EventKind::TransferFinished, "node1", ConsumePolicy::PopAll)
        .await;
    assert!(finished.is_none());
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_nodes_have_separate_buffers() {
    let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
    let first = quiet_node(&swarm, "node1");
    let second = quiet_node(&swarm, "node2");
    let registry = ReplayRegistry::new(Duration::from_secs(5));

    script(&first, InfoHash::new([3u8; 20]));
    second.inject_event(Event::transfer_finished(InfoHash::new([4u8; 20])));

    let from_second = registry
        .wait_for_event(second.as_ref(), EventKind::TransferFinished, "node2", ConsumePolicy::PopThroughMatch)
        .await
        .unwrap();
    assert_eq!(from_second.info_hash(), Some(InfoHash::new([4u8; 20])));
    assert_eq!(first.queued(), 3);

    let from_first = registry
        .wait_for_event(first.as_ref(), EventKind::TransferFinished, "node1", ConsumePolicy::PopThroughMatch)
        .await
        .unwrap();
    assert_eq!(from_first.info_hash(), Some(InfoHash::new([3u8; 20])));
}

#[tokio::test(start_paused = true)]
async fn test_new_identity_starts_with_empty_buffer() {
    let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
    let node = quiet_node(&swarm, "node1");
    let registry = ReplayRegistry::new(Duration::from_secs(1));
    script(&node, InfoHash::new([5u8; 20]));

    let old_id = node.id();
    registry
        .wait_for_event(node.as_ref(), EventKind::TransferAdded, "node1", ConsumePolicy::PopThroughMatch)
        .await
        .unwrap();
    assert_eq!(registry.buffered(old_id).await, 2);

    node.apply_settings(SettingsPack {
        peer_fingerprint: Some(NodeId::new([9u8; 20])),
        ..SettingsPack::default()
    })
    .await
    .unwrap();

    let after = registry
        .wait_for_event(node.as_ref(), EventKind::TransferFinished, "node1", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(after.is_none());
    assert_eq!(registry.buffered(old_id).await, 2);

    registry.forget(old_id);
    assert_eq!(registry.buffered(old_id).await, 0);
}
