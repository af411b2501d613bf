//! Complete transfer scenarios between simulated nodes

use std::sync::Arc;
use std::time::Duration;

use swarmfix_core::content::{
    ContentDescriptor, ContentGenerator, ContentStorage, DEFAULT_LOAD_LIMIT, PieceIndex, load_file,
};
use swarmfix_core::engine::{EventKind, Node, TransferHandle, TransferState};
use swarmfix_core::replay::{format_transfer_rates, wait_for_downloading};
use swarmfix_core::test_fixtures::create_temp_work_dir;
use swarmfix_core::tracing_setup::init_test_tracing;
use swarmfix_core::{ConsumePolicy, FixtureConfig, Role, TestRun, TransferOptions, setup_transfer};
use swarmfix_sim::SimSwarm;

fn fast_run() -> (tempfile::TempDir, TestRun) {
    init_test_tracing();
    let (temp_dir, work_dir) = create_temp_work_dir();
    let mut config = FixtureConfig::fast(work_dir);
    config.events.downloading_timeout = Duration::from_millis(200);
    (temp_dir, TestRun::new(config))
}

async fn assert_on_disk(dir: &std::path::Path, content: &ContentDescriptor) {
    let storage = ContentStorage::new(dir, Arc::new(content.layout.clone()));
    for i in 0..content.piece_count() {
        assert!(
            storage.verify_piece(PieceIndex::new(i), content).await,
            "piece {i} missing under {}",
            dir.display()
        );
    }
}

async fn assert_complete(node: &dyn Node, handle: &TransferHandle) {
    let status = node.transfer_status(handle).await.unwrap();
    assert!(status.is_complete(), "{}: {:?}", node.name(), status);
    assert_eq!(status.state, TransferState::Seeding);
}

#[tokio::test]
async fn test_metadata_transfer_two_nodes() {
    let (_temp_dir, run) = fast_run();
    let swarm = SimSwarm::new(Arc::clone(run.ports()));
    let (_sim_nodes, nodes) = swarm.spawn_nodes(2, false).unwrap();

    let content = ContentGenerator::new(7).generate(&[1000], 16_384).unwrap();
    ContentStorage::new(run.node_dir(1, ""), Arc::new(content.descriptor.layout.clone()))
        .write_all(&content.pieces)
        .await
        .unwrap();

    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            use_metadata_transfer: true,
            content: Some(Arc::clone(&content.descriptor)),
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();

    let metadata = run
        .wait_for_event(nodes[1].as_ref(), EventKind::MetadataReceived, "node2", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(metadata.is_some());
    assert!(wait_for_downloading(run.events(), nodes[1].as_ref(), "node2", Duration::from_secs(2)).await);

    let finished = run
        .wait_for_event(nodes[1].as_ref(), EventKind::TransferFinished, "node2", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(finished.is_some());

    let leech = fixture.handles.leech.unwrap();
    assert_complete(nodes[1].as_ref(), &leech).await;
    assert_on_disk(&fixture.save_paths[1], &content.descriptor).await;

    let downloaded = load_file(fixture.save_paths[1].join("test_dir0/test0"), DEFAULT_LOAD_LIMIT)
        .await
        .unwrap();
    assert_eq!(downloaded, content.concatenated());
}

#[tokio::test]
async fn test_three_nodes_with_leeching_third() {
    let (_temp_dir, run) = fast_run();
    let swarm = SimSwarm::new(Arc::clone(run.ports()));
    let (sim_nodes, nodes) = swarm.spawn_nodes(3, false).unwrap();

    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            third_node_role: Role::Leech,
            piece_size: 4096,
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(fixture.topology, vec![(0, 1), (2, 1), (2, 0)]);

    for (index, label) in [(1, "node2"), (2, "node3")] {
        let finished = run
            .wait_for_event(nodes[index].as_ref(), EventKind::TransferFinished, label, ConsumePolicy::PopThroughMatch)
            .await;
        assert!(finished.is_some(), "{label} did not finish");
    }

    let leech = fixture.handles.leech.unwrap();
    let third = fixture.handles.third.unwrap();
    assert_complete(nodes[1].as_ref(), &leech).await;
    assert_complete(nodes[2].as_ref(), &third).await;
    assert_on_disk(&fixture.save_paths[2], &fixture.content).await;

    // node2 accepted both node1 and node3 from the same address
    assert_eq!(sim_nodes[1].peers(fixture.content.info_hash).len(), 2);

    let seed = fixture.handles.seed.unwrap();
    let statuses = [
        nodes[0].transfer_status(&seed).await.unwrap(),
        nodes[1].transfer_status(&leech).await.unwrap(),
        nodes[2].transfer_status(&third).await.unwrap(),
    ];
    let line = format_transfer_rates(Duration::from_millis(1500), &statuses.iter().collect::<Vec<_>>());
    assert_eq!(line.matches(" : ").count(), 2);
    assert!(line.contains("100%"));
}

#[tokio::test]
async fn test_second_run_reuses_cleared_directories() {
    let (_temp_dir, run) = fast_run();
    let swarm = SimSwarm::new(Arc::clone(run.ports()));

    for round in 0..2 {
        let (_sim_nodes, nodes) = swarm.spawn_nodes(2, false).unwrap();
        let fixture = setup_transfer(&run, &nodes, TransferOptions::default())
            .await
            .unwrap();

        assert!(fixture.handles.leech.is_some());

        let label = format!("node2 round {round}");
        let finished = run
            .wait_for_event(nodes[1].as_ref(), EventKind::TransferFinished, &label, ConsumePolicy::PopThroughMatch)
            .await;
        assert!(finished.is_some(), "{label} did not download again");
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_node_times_out_at_registry_deadline() {
    let (_temp_dir, run) = fast_run();
    let swarm = SimSwarm::new(Arc::clone(run.ports()));
    let node = swarm.spawn_node("node1", false).unwrap();
    node.pop_events();

    let started = tokio::time::Instant::now();
    let event = run
        .wait_for_event(node.as_ref(), EventKind::TransferAdded, "node1", ConsumePolicy::PopAll)
        .await;
    assert!(event.is_none());
    let waited = started.elapsed();
    assert!(waited >= run.events().timeout());
    assert!(waited < run.events().timeout() + Duration::from_millis(50));
}
