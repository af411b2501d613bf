//! Per-node event replay buffers
//!
//! Nodes hand out events in batches, but tests wait for one event at a time.
//! Each node gets a buffer holding events fetched from its queue that no
//! waiter has claimed yet, so a later wait can still see events that arrived
//! together with an earlier match.
//!
//! A scan that finds no match forfeits every scanned event. Callers must not
//! expect to see those events again; this keeps high-volume noisy kinds from
//! growing the buffer without bound.

pub mod observe;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DEFAULT_EVENT_TIMEOUT;
use crate::engine::{Event, EventKind, Node, NodeId};

pub use observe::{DrainOptions, drain_events, format_transfer_rates, get_counters, wait_for_downloading, wait_for_listen};

/// What happens to buffered events once a wait finds its match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumePolicy {
    /// Discard the whole buffer, including events after the match
    PopAll,
    /// Discard the match and everything before it, keep later events
    PopThroughMatch,
}

#[derive(Debug, Default)]
struct ReplayBuffer {
    events: VecDeque<Event>,
}

impl ReplayBuffer {
    /// Scans from the front, logging each scanned event, and claims the
    /// first one accepted by `predicate`.
    ///
    /// Every scanned event leaves the buffer, so nothing is logged twice.
    fn claim<F>(&mut self, label: &str, policy: ConsumePolicy, predicate: &F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut matched = None;
        for (i, event) in self.events.iter().enumerate() {
            if !event.is_noisy {
                tracing::info!("{}: [{}] {}", label, event.kind, event.message);
            }
            if predicate(event) {
                matched = Some(i);
                break;
            }
        }

        let Some(i) = matched else {
            self.events.clear();
            return None;
        };

        match policy {
            ConsumePolicy::PopAll => {
                let event = self.events.remove(i);
                self.events.clear();
                event
            }
            ConsumePolicy::PopThroughMatch => self.events.drain(..=i).last(),
        }
    }
}

/// Replay buffers for every node of a test run.
///
/// Buffers are created lazily per node identity and live as long as the
/// registry. Waits on one node are serialized; other nodes proceed
/// independently.
#[derive(Debug)]
pub struct ReplayRegistry {
    buffers: parking_lot::Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<ReplayBuffer>>>>,
    timeout: Duration,
}

impl Default for ReplayRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_TIMEOUT)
    }
}

impl ReplayRegistry {
    /// Creates registry whose waits give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: parking_lot::Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn buffer_for(&self, id: NodeId) -> Arc<tokio::sync::Mutex<ReplayBuffer>> {
        Arc::clone(self.buffers.lock().entry(id).or_default())
    }

    /// Waits for the first event of `kind`.
    ///
    /// Returns `None` when no such event arrives before the registry
    /// timeout. A timeout is not an error; callers decide whether absence is
    /// a failure.
    pub async fn wait_for_event(
        &self,
        node: &dyn Node,
        kind: EventKind,
        label: &str,
        policy: ConsumePolicy,
    ) -> Option<Event> {
        let deadline = Instant::now() + self.timeout;
        self.wait_for_event_matching(node, label, policy, deadline, |event| {
            event.kind == kind
        })
        .await
    }

    /// Waits for the first event accepted by `predicate` until `deadline`.
    pub async fn wait_for_event_matching<F>(
        &self,
        node: &dyn Node,
        label: &str,
        policy: ConsumePolicy,
        deadline: Instant,
        predicate: F,
    ) -> Option<Event>
    where
        F: Fn(&Event) -> bool + Send,
    {
        let buffer = self.buffer_for(node.id());
        let mut buffer = buffer.lock().await;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("{}: wait for event timed out", label);
                return None;
            }

            if buffer.events.is_empty() {
                node.wait_for_events(deadline - now).await;
                buffer.events.extend(node.pop_events());
            }

            if let Some(event) = buffer.claim(label, policy, &predicate) {
                return Some(event);
            }
        }
    }

    /// Number of events buffered for a node.
    pub async fn buffered(&self, id: NodeId) -> usize {
        let buffer = self.buffers.lock().get(&id).cloned();
        match buffer {
            Some(buffer) => buffer.lock().await.events.len(),
            None => 0,
        }
    }

    /// Drops the buffer of a node, forfeiting anything it held.
    pub fn forget(&self, id: NodeId) {
        self.buffers.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InfoHash;
    use crate::engine::TransferState;
    use crate::engine::test_mocks::ScriptedNode;

    fn hash() -> InfoHash {
        InfoHash::new([3u8; 20])
    }

    fn downloading() -> Event {
        Event::state_changed(hash(), TransferState::CheckingFiles, TransferState::Downloading)
    }

    #[tokio::test]
    async fn test_pop_through_match_keeps_later_events() {
        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_secs(1));
        node.push_events([
            Event::transfer_added(hash()),
            downloading(),
            Event::metadata_received(hash()),
            Event::transfer_finished(hash()),
        ]);

        let first = registry
            .wait_for_event(&node, EventKind::StateChanged, "node1", ConsumePolicy::PopThroughMatch)
            .await
            .unwrap();
        assert_eq!(first.state(), Some(TransferState::Downloading));
        assert_eq!(registry.buffered(node.id()).await, 2);

        let finished = registry
            .wait_for_event(&node, EventKind::TransferFinished, "node1", ConsumePolicy::PopThroughMatch)
            .await;
        assert!(finished.is_some());
        assert_eq!(registry.buffered(node.id()).await, 0);
    }

    #[tokio::test]
    async fn test_pop_all_discards_following_events() {
        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_millis(200));
        node.push_events([downloading(), Event::transfer_finished(hash())]);

        assert!(
            registry
                .wait_for_event(&node, EventKind::StateChanged, "node1", ConsumePolicy::PopAll)
                .await
                .is_some()
        );
        assert_eq!(registry.buffered(node.id()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_forfeits_scanned_events() {
        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_secs(10));
        node.push_events([Event::transfer_added(hash()), downloading()]);

        let result = registry
            .wait_for_event(&node, EventKind::ListenSucceeded, "node1", ConsumePolicy::PopThroughMatch)
            .await;
        assert!(result.is_none());

        // The state change was scanned during the miss and is gone for good
        let again = registry
            .wait_for_event(&node, EventKind::StateChanged, "node1", ConsumePolicy::PopThroughMatch)
            .await;
        assert!(again.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded_by_deadline() {
        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_secs(10));

        let start = Instant::now();
        let result = registry
            .wait_for_event(&node, EventKind::ListenSucceeded, "node1", ConsumePolicy::PopAll)
            .await;
        let waited = start.elapsed();

        assert!(result.is_none());
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_match_arriving_later_is_observed() {
        let node = Arc::new(ScriptedNode::new("node1", 6881));
        let registry = ReplayRegistry::new(Duration::from_secs(5));

        let producer = Arc::clone(&node);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push_event(Event::transfer_added(hash()));
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push_event(downloading());
        });

        let event = registry
            .wait_for_event(node.as_ref(), EventKind::StateChanged, "node1", ConsumePolicy::PopAll)
            .await;
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn test_scanned_events_logged_once_and_noisy_never() {
        use tracing_subscriber::layer::SubscriberExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("replay.log");
        let subscriber = tracing_subscriber::registry()
            .with(crate::tracing_setup::trace_file_layer(std::fs::File::create(&path).unwrap()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let node = ScriptedNode::new("node1", 6881);
        let registry = ReplayRegistry::new(Duration::from_secs(1));
        node.push_events([
            Event::transfer_added(hash()),
            downloading(),
            Event::stats_snapshot(Default::default()),
            Event::transfer_finished(hash()),
        ]);

        for kind in [EventKind::StateChanged, EventKind::TransferFinished] {
            registry
                .wait_for_event(&node, kind, "node1", ConsumePolicy::PopThroughMatch)
                .await
                .unwrap();
        }

        let log = std::fs::read_to_string(&path).unwrap();
        for kind in ["transfer_added", "state_changed", "transfer_finished"] {
            let line = format!("node1: [{kind}]");
            assert_eq!(log.matches(&line).count(), 1, "{kind} in:\n{log}");
        }
        assert!(!log.contains("[stats_snapshot]"));
    }

    #[tokio::test]
    async fn test_buffers_are_per_node() {
        let node1 = ScriptedNode::new("node1", 6881);
        let node2 = ScriptedNode::new("node2", 6882);
        let registry = ReplayRegistry::new(Duration::from_millis(200));
        node1.push_events([downloading(), Event::transfer_finished(hash())]);
        node2.push_events([downloading()]);

        registry
            .wait_for_event(&node1, EventKind::StateChanged, "node1", ConsumePolicy::PopThroughMatch)
            .await
            .unwrap();
        registry
            .wait_for_event(&node2, EventKind::StateChanged, "node2", ConsumePolicy::PopThroughMatch)
            .await
            .unwrap();

        assert_eq!(registry.buffered(node1.id()).await, 1);
        assert_eq!(registry.buffered(node2.id()).await, 0);

        registry.forget(node1.id());
        assert_eq!(registry.buffered(node1.id()).await, 0);
    }
}
