//! Transfer fixtures over simulated nodes

use std::sync::Arc;
use std::time::Duration;

use swarmfix_core::content::{ContentGenerator, ContentStorage, PieceIndex};
use swarmfix_core::engine::{EventKind, Node, TransferState};
use swarmfix_core::fixture::DEFAULT_CONTENT_NAME;
use swarmfix_core::replay::{DrainOptions, drain_events, get_counters, wait_for_listen};
use swarmfix_core::test_fixtures::create_temp_work_dir;
use swarmfix_core::{ConsumePolicy, FixtureConfig, FixtureError, Role, TestRun, TransferOptions, setup_transfer};
use swarmfix_sim::{SimNode, SimSwarm};

fn sim_run(node_count: usize, tls: bool) -> (tempfile::TempDir, TestRun, Vec<Arc<SimNode>>, Vec<Arc<dyn Node>>) {
    let (temp_dir, work_dir) = create_temp_work_dir();
    let mut config = FixtureConfig::fast(work_dir);
    config.events.downloading_timeout = Duration::from_millis(200);
    let run = TestRun::new(config);
    let swarm = SimSwarm::new(Arc::clone(run.ports()));
    let (sim_nodes, nodes) = swarm.spawn_nodes(node_count, tls).unwrap();
    (temp_dir, run, sim_nodes, nodes)
}

#[tokio::test]
async fn test_nodes_report_listening() {
    let (_temp_dir, run, _sim_nodes, nodes) = sim_run(2, true);
    for node in &nodes {
        wait_for_listen(node.as_ref(), node.name(), run.config().events.listen_poll)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_fixture_configures_every_node() {
    let (_temp_dir, run, sim_nodes, nodes) = sim_run(3, false);
    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            connect_peers: false,
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(fixture.roles, vec![Role::Seed, Role::Leech, Role::Leech]);
    assert!(fixture.topology.is_empty());
    for node in &sim_nodes {
        let settings = node.settings();
        assert_eq!(settings.enable_lsd, Some(false));
        assert_eq!(settings.allow_multiple_connections_per_ip, Some(true));
        assert_eq!(settings.max_failcount, Some(1));
        assert_eq!(node.peer_class_filter().rules().len(), 1);
    }
    assert_ne!(sim_nodes[0].id(), sim_nodes[1].id());
    assert_ne!(sim_nodes[1].id(), sim_nodes[2].id());
    assert_ne!(sim_nodes[0].id(), sim_nodes[2].id());
}

#[tokio::test]
async fn test_default_content_is_seeded_from_disk() {
    let (_temp_dir, run, _sim_nodes, nodes) = sim_run(2, false);
    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            connect_peers: false,
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(fixture.content.name, DEFAULT_CONTENT_NAME);
    assert_eq!(fixture.content.piece_count(), 9);
    assert!(fixture.save_paths[0].join(DEFAULT_CONTENT_NAME).is_file());

    let seed = fixture.handles.seed.unwrap();
    let status = nodes[0].transfer_status(&seed).await.unwrap();
    assert_eq!(status.state, TransferState::Seeding);

    let leech = fixture.handles.leech.unwrap();
    let status = nodes[1].transfer_status(&leech).await.unwrap();
    assert_eq!(status.state, TransferState::Downloading);
    assert_eq!(status.pieces_have, 0);
}

#[tokio::test]
async fn test_leech_downloads_default_content() {
    let (_temp_dir, run, _sim_nodes, nodes) = sim_run(2, false);
    let fixture = setup_transfer(&run, &nodes, TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(fixture.topology, vec![(0, 1)]);

    let finished = run
        .wait_for_event(nodes[1].as_ref(), EventKind::TransferFinished, "node2", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(finished.is_some());

    let storage = ContentStorage::new(
        &fixture.save_paths[1],
        Arc::new(fixture.content.layout.clone()),
    );
    for i in 0..fixture.content.piece_count() {
        assert!(storage.verify_piece(PieceIndex::new(i), &fixture.content).await);
    }

    let ok = drain_events(nodes[1].as_ref(), "node2", DrainOptions::default(), |_| false)
        .await
        .unwrap();
    assert!(!ok);

    let counters = get_counters(run.events(), nodes[1].as_ref()).await;
    assert_eq!(
        counters.get("ses.num_pieces_finished"),
        Some(&i64::from(fixture.content.piece_count()))
    );
}

#[tokio::test]
async fn test_tls_ports_are_dialled() {
    let (_temp_dir, run, sim_nodes, nodes) = sim_run(2, true);
    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            use_tls_ports: true,
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();

    let peers = sim_nodes[0].peers(fixture.content.info_hash);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].port(), sim_nodes[1].tls_listen_port());
}

#[tokio::test]
async fn test_supplied_content_is_used() {
    let (_temp_dir, run, _sim_nodes, nodes) = sim_run(2, false);
    let content = ContentGenerator::new(42)
        .generate(&[1000, 30_000], 16_384)
        .unwrap();
    ContentStorage::new(
        run.node_dir(1, "_custom"),
        Arc::new(content.descriptor.layout.clone()),
    )
    .write_all(&content.pieces)
    .await
    .unwrap();

    let fixture = setup_transfer(
        &run,
        &nodes,
        TransferOptions {
            suffix: "_custom".to_string(),
            content: Some(Arc::clone(&content.descriptor)),
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(fixture.content.info_hash, content.descriptor.info_hash);

    let finished = run
        .wait_for_event(nodes[1].as_ref(), EventKind::TransferFinished, "node2", ConsumePolicy::PopThroughMatch)
        .await;
    assert!(finished.is_some());
    assert_eq!(fixture.save_paths[1], run.node_dir(2, "_custom"));
}

#[tokio::test]
async fn test_single_node_is_rejected() {
    let (_temp_dir, run, _sim_nodes, nodes) = sim_run(1, false);
    let result = setup_transfer(&run, &nodes, TransferOptions::default()).await;
    let error = result.unwrap_err();
    assert!(matches!(error, FixtureError::Precondition { .. }));
    assert!(error.is_fatal());
}
