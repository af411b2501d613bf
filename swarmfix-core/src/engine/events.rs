//! Event stream emitted by nodes
//!
//! Nodes report progress asynchronously through events popped from a per-node
//! FIFO queue. Kinds are interleaved arbitrarily, so consumers match on
//! [`EventKind`] and never rely on ordering across kinds.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use crate::content::{InfoHash, PieceIndex};

/// Kind of an engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ListenSucceeded,
    ListenFailed,
    TransferAdded,
    StateChanged,
    MetadataReceived,
    PieceFinished,
    BlockFinished,
    BlockDownloading,
    PeerConnected,
    PeerDisconnected,
    PeerLog,
    InvalidRequest,
    FastresumeRejected,
    HashFailed,
    TransferFinished,
    StatsSnapshot,
}

impl EventKind {
    /// Returns the event kind as a string for log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ListenSucceeded => "listen_succeeded",
            EventKind::ListenFailed => "listen_failed",
            EventKind::TransferAdded => "transfer_added",
            EventKind::StateChanged => "state_changed",
            EventKind::MetadataReceived => "metadata_received",
            EventKind::PieceFinished => "piece_finished",
            EventKind::BlockFinished => "block_finished",
            EventKind::BlockDownloading => "block_downloading",
            EventKind::PeerConnected => "peer_connected",
            EventKind::PeerDisconnected => "peer_disconnected",
            EventKind::PeerLog => "peer_log",
            EventKind::InvalidRequest => "invalid_request",
            EventKind::FastresumeRejected => "fastresume_rejected",
            EventKind::HashFailed => "hash_failed",
            EventKind::TransferFinished => "transfer_finished",
            EventKind::StatsSnapshot => "stats_snapshot",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transfer inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::CheckingFiles => "checking_files",
            TransferState::DownloadingMetadata => "downloading_metadata",
            TransferState::Downloading => "downloading",
            TransferState::Finished => "finished",
            TransferState::Seeding => "seeding",
        };
        f.write_str(name)
    }
}

/// Direction of a peer log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLogDirection {
    IncomingMessage,
    OutgoingMessage,
    Incoming,
    Outgoing,
    Info,
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    Listen {
        endpoint: SocketAddr,
        tls: bool,
    },
    ListenError {
        endpoint: SocketAddr,
        reason: String,
    },
    Transfer {
        info_hash: InfoHash,
    },
    StateChanged {
        info_hash: InfoHash,
        previous: TransferState,
        state: TransferState,
    },
    Piece {
        info_hash: InfoHash,
        piece: PieceIndex,
    },
    Block {
        info_hash: InfoHash,
        piece: PieceIndex,
        block: u32,
    },
    Peer {
        info_hash: InfoHash,
        endpoint: SocketAddr,
    },
    PeerLog {
        endpoint: SocketAddr,
        direction: PeerLogDirection,
        line: String,
    },
    Error {
        info_hash: Option<InfoHash>,
        endpoint: Option<SocketAddr>,
        reason: String,
    },
    Stats {
        counters: BTreeMap<String, i64>,
    },
}

/// One notification popped from a node's event queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Human readable summary
    pub message: String,
    /// High-volume event that is not worth logging
    pub is_noisy: bool,
}

impl Event {
    /// Creates an event, deriving `is_noisy` from kind and payload.
    ///
    /// Stats snapshots and piece/block progress are noisy. Peer log lines are
    /// noisy unless they record an incoming or outgoing protocol message.
    pub fn new(kind: EventKind, payload: EventPayload, message: impl Into<String>) -> Self {
        let is_noisy = match (&kind, &payload) {
            (EventKind::StatsSnapshot, _)
            | (EventKind::PieceFinished, _)
            | (EventKind::BlockFinished, _)
            | (EventKind::BlockDownloading, _) => true,
            (EventKind::PeerLog, EventPayload::PeerLog { direction, .. }) => !matches!(
                direction,
                PeerLogDirection::IncomingMessage | PeerLogDirection::OutgoingMessage
            ),
            (EventKind::PeerLog, _) => true,
            _ => false,
        };

        Self {
            kind,
            payload,
            message: message.into(),
            is_noisy,
        }
    }

    pub fn listen_succeeded(endpoint: SocketAddr, tls: bool) -> Self {
        let socket = if tls { "TLS/TCP" } else { "TCP" };
        Self::new(
            EventKind::ListenSucceeded,
            EventPayload::Listen { endpoint, tls },
            format!("successfully listening on [{socket}] {endpoint}"),
        )
    }

    pub fn listen_failed(endpoint: SocketAddr, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            EventKind::ListenFailed,
            EventPayload::ListenError {
                endpoint,
                reason: reason.clone(),
            },
            format!("listening on {endpoint} failed: {reason}"),
        )
    }

    pub fn transfer_added(info_hash: InfoHash) -> Self {
        Self::new(
            EventKind::TransferAdded,
            EventPayload::Transfer { info_hash },
            format!("{info_hash} added"),
        )
    }

    pub fn state_changed(info_hash: InfoHash, previous: TransferState, state: TransferState) -> Self {
        Self::new(
            EventKind::StateChanged,
            EventPayload::StateChanged {
                info_hash,
                previous,
                state,
            },
            format!("{info_hash}: state changed to: {state}"),
        )
    }

    pub fn metadata_received(info_hash: InfoHash) -> Self {
        Self::new(
            EventKind::MetadataReceived,
            EventPayload::Transfer { info_hash },
            format!("{info_hash} metadata successfully received"),
        )
    }

    pub fn piece_finished(info_hash: InfoHash, piece: PieceIndex) -> Self {
        Self::new(
            EventKind::PieceFinished,
            EventPayload::Piece { info_hash, piece },
            format!("{info_hash}: piece: {piece} finished downloading"),
        )
    }

    pub fn peer_connected(info_hash: InfoHash, endpoint: SocketAddr) -> Self {
        Self::new(
            EventKind::PeerConnected,
            EventPayload::Peer {
                info_hash,
                endpoint,
            },
            format!("{info_hash} peer ({endpoint}) connected"),
        )
    }

    pub fn peer_disconnected(
        info_hash: InfoHash,
        endpoint: SocketAddr,
        reason: impl fmt::Display,
    ) -> Self {
        Self::new(
            EventKind::PeerDisconnected,
            EventPayload::Peer {
                info_hash,
                endpoint,
            },
            format!("{info_hash} disconnecting: {reason}"),
        )
    }

    pub fn peer_log(endpoint: SocketAddr, direction: PeerLogDirection, line: impl Into<String>) -> Self {
        let line = line.into();
        Self::new(
            EventKind::PeerLog,
            EventPayload::PeerLog {
                endpoint,
                direction,
                line: line.clone(),
            },
            format!("{endpoint} {line}"),
        )
    }

    pub fn invalid_request(info_hash: InfoHash, endpoint: SocketAddr, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            EventKind::InvalidRequest,
            EventPayload::Error {
                info_hash: Some(info_hash),
                endpoint: Some(endpoint),
                reason: reason.clone(),
            },
            format!("{info_hash} peer ({endpoint}) invalid piece request: {reason}"),
        )
    }

    pub fn fastresume_rejected(info_hash: InfoHash, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            EventKind::FastresumeRejected,
            EventPayload::Error {
                info_hash: Some(info_hash),
                endpoint: None,
                reason: reason.clone(),
            },
            format!("{info_hash} fast resume rejected: {reason}"),
        )
    }

    pub fn hash_failed(info_hash: InfoHash, piece: PieceIndex) -> Self {
        Self::new(
            EventKind::HashFailed,
            EventPayload::Piece { info_hash, piece },
            format!("{info_hash} hash for piece {piece} failed"),
        )
    }

    pub fn transfer_finished(info_hash: InfoHash) -> Self {
        Self::new(
            EventKind::TransferFinished,
            EventPayload::Transfer { info_hash },
            format!("{info_hash} torrent finished downloading"),
        )
    }

    pub fn stats_snapshot(counters: BTreeMap<String, i64>) -> Self {
        Self::new(
            EventKind::StatsSnapshot,
            EventPayload::Stats { counters },
            "session stats",
        )
    }

    /// New state for state-changed events.
    pub fn state(&self) -> Option<TransferState> {
        match &self.payload {
            EventPayload::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Remote or local endpoint carried by the event, if any.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        match &self.payload {
            EventPayload::Listen { endpoint, .. }
            | EventPayload::ListenError { endpoint, .. }
            | EventPayload::Peer { endpoint, .. }
            | EventPayload::PeerLog { endpoint, .. } => Some(*endpoint),
            EventPayload::Error { endpoint, .. } => *endpoint,
            _ => None,
        }
    }

    /// Transfer the event refers to, if any.
    pub fn info_hash(&self) -> Option<InfoHash> {
        match &self.payload {
            EventPayload::Transfer { info_hash }
            | EventPayload::StateChanged { info_hash, .. }
            | EventPayload::Piece { info_hash, .. }
            | EventPayload::Block { info_hash, .. }
            | EventPayload::Peer { info_hash, .. } => Some(*info_hash),
            EventPayload::Error { info_hash, .. } => *info_hash,
            _ => None,
        }
    }

    /// Counter map of a stats snapshot.
    pub fn counters(&self) -> Option<&BTreeMap<String, i64>> {
        match &self.payload {
            EventPayload::Stats { counters } => Some(counters),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_progress_and_stats_are_noisy() {
        let hash = InfoHash::new([1u8; 20]);
        assert!(Event::piece_finished(hash, PieceIndex::new(0)).is_noisy);
        assert!(Event::stats_snapshot(BTreeMap::new()).is_noisy);
        assert!(
            Event::new(
                EventKind::BlockDownloading,
                EventPayload::Block {
                    info_hash: hash,
                    piece: PieceIndex::new(0),
                    block: 3
                },
                "block"
            )
            .is_noisy
        );
        assert!(!Event::state_changed(hash, TransferState::CheckingFiles, TransferState::Downloading).is_noisy);
        assert!(!Event::peer_disconnected(hash, endpoint(), "closed").is_noisy);
    }

    #[test]
    fn test_peer_log_noise_depends_on_direction() {
        assert!(!Event::peer_log(endpoint(), PeerLogDirection::IncomingMessage, "HAVE").is_noisy);
        assert!(!Event::peer_log(endpoint(), PeerLogDirection::OutgoingMessage, "REQUEST").is_noisy);
        assert!(Event::peer_log(endpoint(), PeerLogDirection::Info, "choke").is_noisy);
        assert!(Event::peer_log(endpoint(), PeerLogDirection::Incoming, "bytes").is_noisy);
    }

    #[test]
    fn test_accessors() {
        let hash = InfoHash::new([2u8; 20]);
        let event = Event::state_changed(hash, TransferState::DownloadingMetadata, TransferState::Downloading);
        assert_eq!(event.state(), Some(TransferState::Downloading));
        assert_eq!(event.info_hash(), Some(hash));
        assert_eq!(event.endpoint(), None);
        assert!(event.message.ends_with("state changed to: downloading"));

        let listen = Event::listen_succeeded(endpoint(), false);
        assert_eq!(listen.endpoint(), Some(endpoint()));
        assert_eq!(listen.to_string(), "[listen_succeeded] successfully listening on [TCP] 127.0.0.1:6881");
    }
}
