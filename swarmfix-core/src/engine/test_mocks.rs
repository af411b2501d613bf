//! Mock implementations for testing fixtures against the engine boundary.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    AddContentParams, ContentSource, EngineError, Event, Node, NodeId, PeerClassFilter,
    SettingsPack, TransferHandle, TransferState, TransferStatus,
};

/// Node whose event stream is scripted by the test.
///
/// Records every call made through the [`Node`] trait. Adding content emits
/// the events a well-behaved engine would: an added event followed by a
/// state change to seeding, downloading metadata or downloading.
#[derive(Debug)]
pub struct ScriptedNode {
    name: String,
    id: Mutex<NodeId>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    listen_port: u16,
    tls_listen_port: u16,
    applied_settings: Mutex<Vec<SettingsPack>>,
    filters: Mutex<Vec<PeerClassFilter>>,
    added: Mutex<Vec<AddContentParams>>,
    connects: Mutex<Vec<(TransferHandle, SocketAddr)>>,
    stats_requests: Mutex<u32>,
    fail_add: AtomicBool,
    ignore_fingerprint: AtomicBool,
}

impl ScriptedNode {
    /// Creates a node with a random identity listening on `listen_port`.
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            id: Mutex::new(NodeId::random()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            listen_port,
            tls_listen_port: 0,
            applied_settings: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            stats_requests: Mutex::new(0),
            fail_add: AtomicBool::new(false),
            ignore_fingerprint: AtomicBool::new(false),
        }
    }

    /// Sets the TLS listen port reported by the node.
    pub fn with_tls_port(mut self, port: u16) -> Self {
        self.tls_listen_port = port;
        self
    }

    /// Makes every subsequent add-content call fail.
    pub fn fail_adds(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }

    /// Makes the node keep its identity when a fingerprint is applied.
    pub fn ignore_fingerprint(&self) {
        self.ignore_fingerprint.store(true, Ordering::SeqCst);
    }

    /// Queues an event and wakes a waiter.
    pub fn push_event(&self, event: Event) {
        self.queue.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Queues several events at once.
    pub fn push_events(&self, events: impl IntoIterator<Item = Event>) {
        self.queue.lock().extend(events);
        self.notify.notify_one();
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn applied_settings(&self) -> Vec<SettingsPack> {
        self.applied_settings.lock().clone()
    }

    pub fn filters(&self) -> Vec<PeerClassFilter> {
        self.filters.lock().clone()
    }

    pub fn added(&self) -> Vec<AddContentParams> {
        self.added.lock().clone()
    }

    pub fn connects(&self) -> Vec<(TransferHandle, SocketAddr)> {
        self.connects.lock().clone()
    }

    pub fn stats_requests(&self) -> u32 {
        *self.stats_requests.lock()
    }
}

#[async_trait]
impl Node for ScriptedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> NodeId {
        *self.id.lock()
    }

    async fn apply_settings(&self, settings: SettingsPack) -> Result<(), EngineError> {
        if let Some(fingerprint) = settings.peer_fingerprint
            && !self.ignore_fingerprint.load(Ordering::SeqCst)
        {
            *self.id.lock() = fingerprint;
        }
        self.applied_settings.lock().push(settings);
        Ok(())
    }

    async fn set_peer_class_filter(&self, filter: PeerClassFilter) -> Result<(), EngineError> {
        self.filters.lock().push(filter);
        Ok(())
    }

    async fn add_content(&self, params: AddContentParams) -> Result<TransferHandle, EngineError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(EngineError::AddContentFailed {
                reason: "scripted failure".to_string(),
            });
        }

        let info_hash = params.info_hash();
        let state = match (&params.source, params.flags.seed_mode) {
            (_, true) => TransferState::Seeding,
            (ContentSource::InfoHash(_), false) => TransferState::DownloadingMetadata,
            (ContentSource::Metadata(_), false) => TransferState::Downloading,
        };

        self.added.lock().push(params);
        self.push_events([
            Event::transfer_added(info_hash),
            Event::state_changed(info_hash, TransferState::CheckingFiles, state),
        ]);

        Ok(TransferHandle {
            info_hash,
            node: self.id(),
        })
    }

    async fn transfers(&self) -> Vec<TransferHandle> {
        let node = self.id();
        self.added
            .lock()
            .iter()
            .map(|params| TransferHandle {
                info_hash: params.info_hash(),
                node,
            })
            .collect()
    }

    async fn transfer_status(&self, handle: &TransferHandle) -> Result<TransferStatus, EngineError> {
        let added = self.added.lock();
        let params = added
            .iter()
            .find(|params| params.info_hash() == handle.info_hash)
            .ok_or(EngineError::TransferNotFound {
                info_hash: handle.info_hash,
            })?;

        let (has_metadata, piece_count) = match &params.source {
            ContentSource::Metadata(descriptor) => (true, descriptor.piece_count()),
            ContentSource::InfoHash(_) => (false, 0),
        };
        let seeding = params.flags.seed_mode;

        Ok(TransferStatus {
            info_hash: handle.info_hash,
            state: if seeding {
                TransferState::Seeding
            } else {
                TransferState::Downloading
            },
            progress: if seeding { 1.0 } else { 0.0 },
            download_payload_rate: 0,
            upload_payload_rate: 0,
            num_peers: 0,
            connect_candidates: 0,
            error: None,
            has_metadata,
            pieces_have: if seeding { piece_count } else { 0 },
            piece_count,
        })
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn tls_listen_port(&self) -> u16 {
        self.tls_listen_port
    }

    async fn connect_peer(
        &self,
        handle: &TransferHandle,
        endpoint: SocketAddr,
    ) -> Result<(), EngineError> {
        self.connects.lock().push((*handle, endpoint));
        Ok(())
    }

    async fn wait_for_events(&self, timeout: Duration) -> bool {
        if !self.queue.lock().is_empty() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        !self.queue.lock().is_empty()
    }

    fn pop_events(&self) -> Vec<Event> {
        self.queue.lock().drain(..).collect()
    }

    fn post_stats(&self) {
        *self.stats_requests.lock() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InfoHash;

    #[tokio::test]
    async fn test_fingerprint_changes_identity() {
        let node = ScriptedNode::new("node1", 6881);
        let wanted = NodeId::new([7u8; 20]);

        node.apply_settings(SettingsPack {
            peer_fingerprint: Some(wanted),
            ..SettingsPack::default()
        })
        .await
        .unwrap();
        assert_eq!(node.id(), wanted);

        node.ignore_fingerprint();
        node.apply_settings(SettingsPack {
            peer_fingerprint: Some(NodeId::new([8u8; 20])),
            ..SettingsPack::default()
        })
        .await
        .unwrap();
        assert_eq!(node.id(), wanted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_empty_queue() {
        let node = ScriptedNode::new("node1", 6881);
        assert!(!node.wait_for_events(Duration::from_secs(1)).await);

        node.push_event(Event::transfer_added(InfoHash::new([1u8; 20])));
        assert!(node.wait_for_events(Duration::from_secs(1)).await);
        assert_eq!(node.pop_events().len(), 1);
        assert_eq!(node.queued(), 0);
    }
}
