//! Higher level observations built on node event streams

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use super::{ConsumePolicy, ReplayRegistry};
use crate::FixtureError;
use crate::engine::{Event, EventKind, Node, TransferState, TransferStatus};

/// Tolerances for [`drain_events`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainOptions {
    /// Do not fail when the node runs no transfers
    pub allow_no_transfers: bool,
    /// Do not fail on rejected fast-resume data
    pub allow_failed_fastresume: bool,
    /// Suppress logging of ordinary events
    pub quiet: bool,
}

/// Pops everything currently queued on a node and checks it for failures.
///
/// Bypasses the replay buffer. Returns whether `predicate` accepted any of
/// the popped events. All events are processed before an error is returned.
///
/// # Errors
///
/// - `FixtureError::Precondition` - Node runs no transfers and that is not allowed
/// - `FixtureError::EngineReported` - Invalid request event, or rejected fast-resume data when not allowed
pub async fn drain_events<F>(
    node: &dyn Node,
    label: &str,
    options: DrainOptions,
    mut predicate: F,
) -> Result<bool, FixtureError>
where
    F: FnMut(&Event) -> bool + Send,
{
    let mut failure = None;
    if !options.allow_no_transfers && node.transfers().await.is_empty() {
        failure = Some(FixtureError::Precondition {
            reason: format!("{label} runs no transfers"),
        });
    }

    let mut accepted = false;
    for event in node.pop_events() {
        if predicate(&event) {
            accepted = true;
        }

        match event.kind {
            EventKind::PeerDisconnected => {
                let endpoint = event
                    .endpoint()
                    .map_or_else(|| "-".to_string(), |endpoint| endpoint.to_string());
                tracing::info!("{}: [{}] ({}): {}", label, event.kind, endpoint, event.message);
            }
            _ if !event.is_noisy && !options.quiet => {
                tracing::info!("{}: [{}] {}", label, event.kind, event.message);
            }
            _ => {}
        }

        match event.kind {
            EventKind::FastresumeRejected if !options.allow_failed_fastresume => {
                tracing::error!("{}: fast resume rejected: {}", label, event.message);
                if failure.is_none() {
                    failure = Some(reported(label, &event));
                }
            }
            EventKind::InvalidRequest => {
                tracing::error!("{}: peer error: {}", label, event.message);
                if failure.is_none() {
                    failure = Some(reported(label, &event));
                }
            }
            _ => {}
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(accepted),
    }
}

fn reported(label: &str, event: &Event) -> FixtureError {
    FixtureError::EngineReported {
        node: label.to_string(),
        message: event.message.clone(),
    }
}

/// Waits until the node reports the outcome of opening its listen socket.
///
/// Either a listen-succeeded or a listen-failed event ends the wait. Polls
/// every `poll` while new events keep arriving.
///
/// # Errors
///
/// - `FixtureError::ListenNotObserved` - Events dried up without a listen event
/// - `FixtureError::EngineReported` - Invalid request seen while draining
pub async fn wait_for_listen(node: &dyn Node, label: &str, poll: Duration) -> Result<(), FixtureError> {
    let options = DrainOptions {
        allow_no_transfers: true,
        allow_failed_fastresume: true,
        quiet: false,
    };

    loop {
        let listen_done = drain_events(node, label, options, |event| {
            matches!(
                event.kind,
                EventKind::ListenSucceeded | EventKind::ListenFailed
            )
        })
        .await?;

        if listen_done {
            return Ok(());
        }
        if !node.wait_for_events(poll).await {
            break;
        }
    }

    Err(FixtureError::ListenNotObserved {
        node: label.to_string(),
    })
}

/// Waits up to `cap` for a transfer on the node to start downloading.
///
/// Never fails: a miss is logged with the time waited and reported as
/// `false`. Later events stay buffered for subsequent waits.
pub async fn wait_for_downloading(
    registry: &ReplayRegistry,
    node: &dyn Node,
    label: &str,
    cap: Duration,
) -> bool {
    let start = Instant::now();
    let downloading = registry
        .wait_for_event_matching(
            node,
            label,
            ConsumePolicy::PopThroughMatch,
            start + cap,
            |event| {
                event.kind == EventKind::StateChanged
                    && event.state() == Some(TransferState::Downloading)
            },
        )
        .await
        .is_some();

    if !downloading {
        tracing::warn!(
            "{}: did not observe a state change to downloading, waited {} ms",
            label,
            start.elapsed().as_millis()
        );
    }
    downloading
}

/// Requests a stats snapshot and returns its counters.
///
/// Returns an empty map when no snapshot arrives in time.
pub async fn get_counters(registry: &ReplayRegistry, node: &dyn Node) -> BTreeMap<String, i64> {
    node.post_stats();

    let snapshot = registry
        .wait_for_event(node, EventKind::StatsSnapshot, "get_counters()", ConsumePolicy::PopAll)
        .await;

    match snapshot.as_ref().and_then(Event::counters) {
        Some(counters) => counters.clone(),
        None => {
            tracing::warn!("{}: no stats snapshot received", node.name());
            BTreeMap::new()
        }
    }
}

/// One-line rate and progress summary for up to three transfers.
pub fn format_transfer_rates(elapsed: Duration, statuses: &[&TransferStatus]) -> String {
    statuses
        .iter()
        .take(3)
        .map(|status| {
            let error = status
                .error
                .as_ref()
                .map_or_else(String::new, |message| format!(" [{message}]"));
            format!(
                "{:3.1}s | {}kB/s {}kB/s {}% {} cc:{}{}",
                elapsed.as_secs_f32(),
                status.download_payload_rate / 1000,
                status.upload_payload_rate / 1000,
                (status.progress * 100.0) as u32,
                status.num_peers,
                status.connect_candidates,
                error
            )
        })
        .collect::<Vec<_>>()
        .join(" : ")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::content::InfoHash;
    use crate::engine::test_mocks::ScriptedNode;

    fn hash() -> InfoHash {
        InfoHash::new([4u8; 20])
    }

    fn endpoint() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_drain_fails_on_invalid_request() {
        let node = ScriptedNode::new("node1", 6881);
        node.push_events([
            Event::invalid_request(hash(), endpoint(), "piece out of range"),
            Event::transfer_finished(hash()),
        ]);

        let options = DrainOptions {
            allow_no_transfers: true,
            ..DrainOptions::default()
        };
        let result = drain_events(&node, "node1", options, |_| false).await;
        assert!(matches!(result, Err(FixtureError::EngineReported { .. })));
        // Remaining events are still consumed
        assert_eq!(node.queued(), 0);
    }

    #[tokio::test]
    async fn test_drain_fastresume_tolerance() {
        let node = ScriptedNode::new("node1", 6881);
        let strict = DrainOptions {
            allow_no_transfers: true,
            ..DrainOptions::default()
        };
        node.push_event(Event::fastresume_rejected(hash(), "mismatching file size"));
        assert!(drain_events(&node, "node1", strict, |_| false).await.is_err());

        let lenient = DrainOptions {
            allow_failed_fastresume: true,
            ..strict
        };
        node.push_event(Event::fastresume_rejected(hash(), "mismatching file size"));
        let accepted = drain_events(&node, "node1", lenient, |event| {
            event.kind == EventKind::FastresumeRejected
        })
        .await
        .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_drain_requires_transfers_by_default() {
        let node = ScriptedNode::new("node1", 6881);
        let result = drain_events(&node, "node1", DrainOptions::default(), |_| false).await;
        assert!(matches!(result, Err(FixtureError::Precondition { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_listen_sees_listen_event() {
        let node = ScriptedNode::new("node1", 6881);
        node.push_events([
            Event::transfer_added(hash()),
            Event::listen_succeeded(endpoint(), false),
        ]);
        wait_for_listen(&node, "node1", Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_listen_without_event_fails() {
        let node = ScriptedNode::new("node1", 6881);
        let result = wait_for_listen(&node, "node1", Duration::from_millis(500)).await;
        assert!(matches!(result, Err(FixtureError::ListenNotObserved { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_downloading_keeps_later_events() {
        let node = ScriptedNode::new("node2", 6882);
        let registry = ReplayRegistry::new(Duration::from_secs(10));
        node.push_events([
            Event::state_changed(hash(), TransferState::CheckingFiles, TransferState::DownloadingMetadata),
            Event::state_changed(hash(), TransferState::DownloadingMetadata, TransferState::Downloading),
            Event::transfer_finished(hash()),
        ]);

        assert!(wait_for_downloading(&registry, &node, "node2", Duration::from_secs(10)).await);
        assert_eq!(registry.buffered(node.id()).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_downloading_gives_up_at_cap() {
        let node = ScriptedNode::new("node2", 6882);
        let registry = ReplayRegistry::new(Duration::from_secs(60));

        let start = Instant::now();
        assert!(!wait_for_downloading(&registry, &node, "node2", Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_counters_without_snapshot_is_empty() {
        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_secs(1));

        assert!(get_counters(&registry, &node).await.is_empty());
        assert_eq!(node.stats_requests(), 1);

        let mut counters = BTreeMap::new();
        counters.insert("net.sent_payload_bytes".to_string(), 1000);
        node.push_event(Event::stats_snapshot(counters));
        let received = get_counters(&registry, &node).await;
        assert_eq!(received.get("net.sent_payload_bytes"), Some(&1000));
    }

    #[test]
    fn test_rate_line_format() {
        let status = TransferStatus {
            info_hash: hash(),
            state: TransferState::Downloading,
            progress: 0.5,
            download_payload_rate: 12_000,
            upload_payload_rate: 3_000,
            num_peers: 2,
            connect_candidates: 1,
            error: None,
            has_metadata: true,
            pieces_have: 1,
            piece_count: 2,
        };
        let mut failed = status.clone();
        failed.error = Some("disk full".to_string());

        let line = format_transfer_rates(Duration::from_millis(1500), &[&status, &failed]);
        assert_eq!(
            line,
            "1.5s | 12kB/s 3kB/s 50% 2 cc:1 : 1.5s | 12kB/s 3kB/s 50% 2 cc:1 [disk full]"
        );
    }
}
