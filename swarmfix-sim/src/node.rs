//! Simulated engine node
//!
//! Keeps per-transfer piece bookkeeping in memory and piece data on disk
//! through [`ContentStorage`], so a completed download leaves the same file
//! tree a real engine would.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use swarmfix_core::content::{ContentDescriptor, ContentStorage, InfoHash, PieceIndex};
use swarmfix_core::engine::{
    AddContentParams, ContentSource, EngineError, Event, EventMask, Node, NodeId, PeerClassFilter,
    SettingsPack, TransferFlags, TransferHandle, TransferState, TransferStatus,
};
use swarmfix_core::network::loopback;

use crate::exchange;
use crate::queue::EventQueue;
use crate::swarm::SwarmRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Missing,
    Requested,
    Have,
}

#[derive(Debug)]
struct SimTransfer {
    descriptor: Option<Arc<ContentDescriptor>>,
    storage: Option<ContentStorage>,
    save_path: PathBuf,
    flags: TransferFlags,
    state: TransferState,
    pieces: Vec<PieceState>,
    peers: Vec<SocketAddr>,
    downloaded: u64,
    uploaded: u64,
}

impl SimTransfer {
    fn pieces_have(&self) -> u32 {
        self.pieces.iter().filter(|&&p| p == PieceState::Have).count() as u32
    }

    fn is_complete(&self) -> bool {
        self.descriptor.is_some() && self.pieces.iter().all(|&p| p == PieceState::Have)
    }

    fn set_state(&mut self, info_hash: InfoHash, state: TransferState) -> Option<Event> {
        if self.state == state {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, state);
        Some(Event::state_changed(info_hash, previous, state))
    }
}

/// In-process node implementing the engine boundary.
///
/// Nodes start with every event category enabled so the listen events
/// queued at spawn are visible before any settings are applied.
#[derive(Debug)]
pub struct SimNode {
    name: String,
    id: Mutex<NodeId>,
    settings: Mutex<SettingsPack>,
    filter: Mutex<PeerClassFilter>,
    listen_port: u16,
    tls_listen_port: u16,
    events: EventQueue,
    transfers: Mutex<HashMap<InfoHash, SimTransfer>>,
    counters: Mutex<BTreeMap<String, i64>>,
    registry: Arc<SwarmRegistry>,
}

impl SimNode {
    pub(crate) fn new(
        name: String,
        listen_port: u16,
        tls_listen_port: u16,
        registry: Arc<SwarmRegistry>,
    ) -> Self {
        Self {
            name,
            id: Mutex::new(NodeId::random()),
            settings: Mutex::new(SettingsPack::default()),
            filter: Mutex::new(PeerClassFilter::new()),
            listen_port,
            tls_listen_port,
            events: EventQueue::new(EventMask::ALL),
            transfers: Mutex::new(HashMap::new()),
            counters: Mutex::new(BTreeMap::new()),
            registry,
        }
    }

    pub(crate) fn announce_listen(&self) {
        self.events.push(Event::listen_succeeded(loopback(self.listen_port), false));
        if self.tls_listen_port != 0 {
            self.events
                .push(Event::listen_succeeded(loopback(self.tls_listen_port), true));
        }
    }

    /// Settings accumulated from every applied pack.
    pub fn settings(&self) -> SettingsPack {
        self.settings.lock().clone()
    }

    pub fn peer_class_filter(&self) -> PeerClassFilter {
        self.filter.lock().clone()
    }

    /// Number of events waiting to be popped.
    pub fn queued(&self) -> usize {
        self.events.len()
    }

    /// Queues an arbitrary event, subject to the event mask.
    pub fn inject_event(&self, event: Event) -> bool {
        self.events.push(event)
    }

    /// Endpoints of peers connected to a transfer.
    pub fn peers(&self, info_hash: InfoHash) -> Vec<SocketAddr> {
        self.transfers
            .lock()
            .get(&info_hash)
            .map(|transfer| transfer.peers.clone())
            .unwrap_or_default()
    }

    fn bump(&self, counter: &str, amount: i64) {
        *self.counters.lock().entry(counter.to_string()).or_insert(0) += amount;
    }

    fn allows_multiple_per_ip(&self) -> bool {
        self.settings.lock().allow_multiple_connections_per_ip == Some(true)
    }

    /// Registers `endpoint` as a peer of `info_hash`.
    ///
    /// Refuses a second peer from an address already connected unless
    /// multiple connections per IP are allowed.
    fn add_peer(&self, info_hash: InfoHash, endpoint: SocketAddr) -> Result<(), &'static str> {
        let multiple = self.allows_multiple_per_ip();
        let mut transfers = self.transfers.lock();
        let transfer = transfers.get_mut(&info_hash).ok_or("torrent not found")?;

        if transfer.peers.contains(&endpoint) {
            return Err("duplicate connection");
        }
        if !multiple && transfer.peers.iter().any(|peer| peer.ip() == endpoint.ip()) {
            return Err("duplicate peer IP");
        }
        transfer.peers.push(endpoint);
        Ok(())
    }

    fn remove_peer(&self, info_hash: InfoHash, endpoint: SocketAddr) {
        if let Some(transfer) = self.transfers.lock().get_mut(&info_hash) {
            transfer.peers.retain(|peer| *peer != endpoint);
        }
    }

    fn refuse(&self, info_hash: InfoHash, endpoint: SocketAddr, reason: &str) {
        tracing::debug!("{}: refusing {} for {}: {}", self.name, endpoint, info_hash, reason);
        self.events
            .push(Event::peer_disconnected(info_hash, endpoint, reason));
    }

    pub(crate) fn metadata(&self, info_hash: InfoHash) -> Option<Arc<ContentDescriptor>> {
        self.transfers
            .lock()
            .get(&info_hash)
            .and_then(|transfer| transfer.descriptor.clone())
    }

    /// Installs metadata fetched from a peer. Returns false if already known.
    pub(crate) fn receive_metadata(&self, info_hash: InfoHash, descriptor: Arc<ContentDescriptor>) -> bool {
        let mut transfers = self.transfers.lock();
        let Some(transfer) = transfers.get_mut(&info_hash) else {
            return false;
        };
        if transfer.descriptor.is_some() {
            return false;
        }

        transfer.storage = Some(ContentStorage::new(
            transfer.save_path.clone(),
            Arc::new(descriptor.layout.clone()),
        ));
        transfer.pieces = vec![PieceState::Missing; descriptor.piece_count() as usize];
        transfer.descriptor = Some(descriptor);

        self.events.push(Event::metadata_received(info_hash));
        if let Some(event) = transfer.set_state(info_hash, TransferState::Downloading) {
            self.events.push(event);
        }
        true
    }

    pub(crate) fn available_pieces(&self, info_hash: InfoHash) -> Vec<bool> {
        self.transfers
            .lock()
            .get(&info_hash)
            .map(|transfer| {
                transfer
                    .pieces
                    .iter()
                    .map(|&p| p == PieceState::Have)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reserves the first missing piece that `available` offers.
    pub(crate) fn claim_missing(&self, info_hash: InfoHash, available: &[bool]) -> Option<PieceIndex> {
        let mut transfers = self.transfers.lock();
        let transfer = transfers.get_mut(&info_hash)?;
        if transfer.flags.paused {
            return None;
        }

        let index = transfer
            .pieces
            .iter()
            .zip(available)
            .position(|(&state, &offered)| state == PieceState::Missing && offered)?;
        transfer.pieces[index] = PieceState::Requested;
        Some(PieceIndex::new(index as u32))
    }

    pub(crate) fn release_claim(&self, info_hash: InfoHash, index: PieceIndex) {
        if let Some(transfer) = self.transfers.lock().get_mut(&info_hash)
            && let Some(state) = transfer.pieces.get_mut(index.as_u32() as usize)
            && *state == PieceState::Requested
        {
            *state = PieceState::Missing;
        }
    }

    /// Reads a piece for a peer.
    ///
    /// A piece that cannot be read back intact is marked missing and reported
    /// as a hash failure.
    pub(crate) async fn serve_piece(&self, info_hash: InfoHash, index: PieceIndex) -> Option<Bytes> {
        let (storage, descriptor) = {
            let transfers = self.transfers.lock();
            let transfer = transfers.get(&info_hash)?;
            (transfer.storage.clone()?, transfer.descriptor.clone()?)
        };

        let data = storage.read_piece(index).await.ok();
        let intact = data
            .as_ref()
            .is_some_and(|data| descriptor.verify_piece(index, data));

        let mut transfers = self.transfers.lock();
        let transfer = transfers.get_mut(&info_hash)?;
        if !intact {
            if let Some(state) = transfer.pieces.get_mut(index.as_u32() as usize) {
                *state = PieceState::Missing;
            }
            tracing::warn!("{}: piece {} of {} unreadable", self.name, index, info_hash);
            self.events.push(Event::hash_failed(info_hash, index));
            return None;
        }

        let data = data?;
        transfer.uploaded += data.len() as u64;
        drop(transfers);
        self.bump("net.sent_payload_bytes", data.len() as i64);
        Some(data)
    }

    /// Verifies and stores a piece received from a peer.
    ///
    /// Returns false when the piece failed its hash check or could not be
    /// written.
    pub(crate) async fn store_piece(&self, info_hash: InfoHash, index: PieceIndex, data: Bytes) -> bool {
        let Some((storage, descriptor)) = ({
            let transfers = self.transfers.lock();
            transfers.get(&info_hash).and_then(|transfer| {
                Some((transfer.storage.clone()?, transfer.descriptor.clone()?))
            })
        }) else {
            return false;
        };

        self.bump("net.recv_payload_bytes", data.len() as i64);
        if !descriptor.verify_piece(index, &data) {
            self.release_claim(info_hash, index);
            self.bump("ses.num_hash_failures", 1);
            self.events.push(Event::hash_failed(info_hash, index));
            return false;
        }

        if let Err(e) = storage.write_piece(index, &data).await {
            tracing::warn!("{}: writing piece {} failed: {}", self.name, index, e);
            self.release_claim(info_hash, index);
            return false;
        }

        self.bump("ses.num_pieces_finished", 1);
        let mut transfers = self.transfers.lock();
        let Some(transfer) = transfers.get_mut(&info_hash) else {
            return false;
        };
        if let Some(state) = transfer.pieces.get_mut(index.as_u32() as usize) {
            *state = PieceState::Have;
        }
        transfer.downloaded += data.len() as u64;
        self.events.push(Event::piece_finished(info_hash, index));

        if transfer.is_complete() && transfer.state != TransferState::Seeding {
            self.events.push(Event::transfer_finished(info_hash));
            if let Some(event) = transfer.set_state(info_hash, TransferState::Seeding) {
                self.events.push(event);
            }
        }
        true
    }
}

#[async_trait]
impl Node for SimNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> NodeId {
        *self.id.lock()
    }

    async fn apply_settings(&self, settings: SettingsPack) -> Result<(), EngineError> {
        if settings.max_failcount == Some(0) {
            return Err(EngineError::SettingsRejected {
                reason: "max_failcount must be positive".to_string(),
            });
        }
        if let Some(fingerprint) = settings.peer_fingerprint {
            *self.id.lock() = fingerprint;
        }
        if let Some(mask) = settings.event_mask {
            self.events.set_mask(mask);
        }
        self.settings.lock().merge(&settings);
        Ok(())
    }

    async fn set_peer_class_filter(&self, filter: PeerClassFilter) -> Result<(), EngineError> {
        *self.filter.lock() = filter;
        Ok(())
    }

    async fn add_content(&self, params: AddContentParams) -> Result<TransferHandle, EngineError> {
        let info_hash = params.info_hash();
        if self.transfers.lock().contains_key(&info_hash) {
            return Err(EngineError::AddContentFailed {
                reason: format!("{info_hash} already added"),
            });
        }

        let (descriptor, storage, pieces) = match &params.source {
            ContentSource::Metadata(descriptor) => {
                let storage = ContentStorage::new(
                    params.save_path.clone(),
                    Arc::new(descriptor.layout.clone()),
                );
                let mut pieces = Vec::with_capacity(descriptor.piece_count() as usize);
                for i in 0..descriptor.piece_count() {
                    let index = PieceIndex::new(i);
                    let have =
                        params.flags.seed_mode || storage.verify_piece(index, descriptor).await;
                    pieces.push(if have {
                        PieceState::Have
                    } else {
                        PieceState::Missing
                    });
                }
                (Some(Arc::clone(descriptor)), Some(storage), pieces)
            }
            ContentSource::InfoHash(_) => (None, None, Vec::new()),
        };

        let mut transfer = SimTransfer {
            descriptor,
            storage,
            save_path: params.save_path.clone(),
            flags: params.flags,
            state: TransferState::CheckingFiles,
            pieces,
            peers: Vec::new(),
            downloaded: 0,
            uploaded: 0,
        };
        let state = if transfer.descriptor.is_none() {
            TransferState::DownloadingMetadata
        } else if transfer.is_complete() {
            TransferState::Seeding
        } else {
            TransferState::Downloading
        };
        let state_event = transfer.set_state(info_hash, state);

        {
            let mut transfers = self.transfers.lock();
            if transfers.contains_key(&info_hash) {
                return Err(EngineError::AddContentFailed {
                    reason: format!("{info_hash} already added"),
                });
            }
            transfers.insert(info_hash, transfer);
        }

        tracing::debug!("{}: added {} in state {}", self.name, info_hash, state);
        self.events.push(Event::transfer_added(info_hash));
        if let Some(event) = state_event {
            self.events.push(event);
        }

        Ok(TransferHandle {
            info_hash,
            node: self.id(),
        })
    }

    async fn transfers(&self) -> Vec<TransferHandle> {
        let node = self.id();
        let mut handles: Vec<TransferHandle> = self
            .transfers
            .lock()
            .keys()
            .map(|&info_hash| TransferHandle { info_hash, node })
            .collect();
        handles.sort_by_key(|handle| handle.info_hash);
        handles
    }

    async fn transfer_status(&self, handle: &TransferHandle) -> Result<TransferStatus, EngineError> {
        let transfers = self.transfers.lock();
        let transfer = transfers
            .get(&handle.info_hash)
            .ok_or(EngineError::TransferNotFound {
                info_hash: handle.info_hash,
            })?;

        let piece_count = transfer.pieces.len() as u32;
        let pieces_have = transfer.pieces_have();
        let progress = if transfer.descriptor.is_none() {
            0.0
        } else if piece_count == 0 {
            1.0
        } else {
            pieces_have as f32 / piece_count as f32
        };

        Ok(TransferStatus {
            info_hash: handle.info_hash,
            state: transfer.state,
            progress,
            download_payload_rate: 0,
            upload_payload_rate: 0,
            num_peers: transfer.peers.len() as u32,
            connect_candidates: 0,
            error: None,
            has_metadata: transfer.descriptor.is_some(),
            pieces_have,
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
        let info_hash = handle.info_hash;
        if !self.transfers.lock().contains_key(&info_hash) {
            return Err(EngineError::TransferNotFound { info_hash });
        }

        let Some(remote) = self.registry.lookup(endpoint.port()) else {
            self.refuse(info_hash, endpoint, "connection refused");
            return Ok(());
        };
        if remote.listen_port == self.listen_port {
            self.refuse(info_hash, endpoint, "self connection");
            return Ok(());
        }
        if remote.id() == self.id() {
            self.refuse(info_hash, endpoint, "duplicate peer-id");
            return Ok(());
        }

        if let Err(reason) = self.add_peer(info_hash, endpoint) {
            self.refuse(info_hash, endpoint, reason);
            return Ok(());
        }
        let local = loopback(self.listen_port);
        if let Err(reason) = remote.add_peer(info_hash, local) {
            self.remove_peer(info_hash, endpoint);
            remote.refuse(info_hash, local, reason);
            self.refuse(info_hash, endpoint, reason);
            return Ok(());
        }

        self.events.push(Event::peer_connected(info_hash, endpoint));
        remote.events.push(Event::peer_connected(info_hash, local));
        self.bump("peer.num_peers_connected", 1);
        remote.bump("peer.num_peers_connected", 1);

        match self.registry.lookup(self.listen_port) {
            Some(this) => {
                tokio::spawn(exchange::run(this, remote, info_hash));
            }
            None => tracing::warn!("{}: not registered, skipping exchange", self.name),
        }
        Ok(())
    }

    async fn wait_for_events(&self, timeout: Duration) -> bool {
        self.events.wait(timeout).await
    }

    fn pop_events(&self) -> Vec<Event> {
        self.events.drain()
    }

    fn post_stats(&self) {
        let mut counters = self.counters.lock().clone();
        let transfers = self.transfers.lock();
        counters.insert("ses.num_transfers".to_string(), transfers.len() as i64);
        counters.insert(
            "ses.num_downloaded_bytes".to_string(),
            transfers.values().map(|t| t.downloaded as i64).sum(),
        );
        counters.insert(
            "ses.num_uploaded_bytes".to_string(),
            transfers.values().map(|t| t.uploaded as i64).sum(),
        );
        drop(transfers);
        self.events.push(Event::stats_snapshot(counters));
    }
}

impl Drop for SimNode {
    fn drop(&mut self) {
        self.registry
            .unregister(&[self.listen_port, self.tls_listen_port]);
    }
}

#[cfg(test)]
mod tests {
    use swarmfix_core::content::{ContentGenerator, ContentStorage};
    use swarmfix_core::engine::EventKind;
    use swarmfix_core::network::PortAllocator;
    use tempfile::TempDir;

    use super::*;
    use crate::SimSwarm;

    fn swarm() -> SimSwarm {
        SimSwarm::new(Arc::new(PortAllocator::default()))
    }

    #[tokio::test]
    async fn test_listen_events_at_spawn() {
        let swarm = swarm();
        let node = swarm.spawn_node("node1", true).unwrap();
        let kinds: Vec<_> = node.pop_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ListenSucceeded, EventKind::ListenSucceeded]);
    }

    #[tokio::test]
    async fn test_add_checks_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let content = ContentGenerator::new(3).generate(&[40_000], 16_384).unwrap();
        ContentStorage::new(temp_dir.path(), Arc::new(content.descriptor.layout.clone()))
            .write_all(&content.pieces)
            .await
            .unwrap();

        let swarm = swarm();
        let node = swarm.spawn_node("node1", false).unwrap();
        node.pop_events();

        let handle = node
            .add_content(AddContentParams::with_metadata(
                Arc::clone(&content.descriptor),
                temp_dir.path(),
            ))
            .await
            .unwrap();

        let status = node.transfer_status(&handle).await.unwrap();
        assert_eq!(status.state, TransferState::Seeding);
        assert!(status.is_complete());
        assert!(matches!(
            node.add_content(AddContentParams::with_metadata(
                Arc::clone(&content.descriptor),
                temp_dir.path()
            ))
            .await,
            Err(EngineError::AddContentFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_settings_mask_and_identity() {
        let swarm = swarm();
        let node = swarm.spawn_node("node1", false).unwrap();
        node.pop_events();

        let id = NodeId::new([4u8; 20]);
        node.apply_settings(SettingsPack {
            peer_fingerprint: Some(id),
            event_mask: Some(EventMask::ERROR),
            ..SettingsPack::default()
        })
        .await
        .unwrap();
        assert_eq!(node.id(), id);

        node.post_stats();
        assert_eq!(node.queued(), 0);

        let rejected = node
            .apply_settings(SettingsPack {
                max_failcount: Some(0),
                ..SettingsPack::default()
            })
            .await;
        assert!(matches!(rejected, Err(EngineError::SettingsRejected { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_port_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let content = ContentGenerator::new(1).generate(&[1000], 16_384).unwrap();
        let swarm = swarm();
        let node = swarm.spawn_node("node1", false).unwrap();
        let handle = node
            .add_content(AddContentParams::with_metadata(
                Arc::clone(&content.descriptor),
                temp_dir.path(),
            ))
            .await
            .unwrap();
        node.pop_events();

        node.connect_peer(&handle, loopback(1)).await.unwrap();
        let events = node.pop_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PeerDisconnected);
        assert!(events[0].message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_second_peer_from_same_ip_needs_permission() {
        let temp_dir = TempDir::new().unwrap();
        let content = ContentGenerator::new(1).generate(&[1000], 16_384).unwrap();
        let swarm = swarm();
        let (nodes, _) = swarm.spawn_nodes(3, false).unwrap();

        let mut handles = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let params = AddContentParams::with_metadata(
                Arc::clone(&content.descriptor),
                temp_dir.path().join(format!("n{i}")),
            );
            handles.push(node.add_content(params).await.unwrap());
        }

        nodes[0]
            .connect_peer(&handles[0], loopback(nodes[1].listen_port()))
            .await
            .unwrap();
        nodes[2]
            .connect_peer(&handles[2], loopback(nodes[1].listen_port()))
            .await
            .unwrap();

        assert_eq!(nodes[1].peers(content.descriptor.info_hash).len(), 1);
        assert!(nodes[2].peers(content.descriptor.info_hash).is_empty());
    }
}
