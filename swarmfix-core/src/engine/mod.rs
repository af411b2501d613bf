//! Boundary to the transfer engine under test
//!
//! Fixtures never reach into an engine: everything they need is expressed by
//! the [`Node`] trait, implemented by real engine bindings and by the
//! in-process simulation.

pub mod events;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

pub use events::{Event, EventKind, EventPayload, PeerLogDirection, TransferState};
pub use settings::{
    AddContentParams, ContentSource, EventMask, GLOBAL_PEER_CLASS, MixedMode, PeerClassFilter,
    PeerClassRule, SettingsPack, TransferFlags,
};

use crate::content::InfoHash;

/// 20-byte identity a node presents to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a uniformly random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidIdentity` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, EngineError> {
        let mut id = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut id).map_err(|e| EngineError::InvalidIdentity {
            reason: format!("{hex_str}: {e}"),
        })?;
        Ok(Self(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors reported by a node through the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Settings rejected: {reason}")]
    SettingsRejected { reason: String },

    #[error("Failed to add content: {reason}")]
    AddContentFailed { reason: String },

    #[error("Transfer {info_hash} not found")]
    TransferNotFound { info_hash: InfoHash },

    #[error("Connecting to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: SocketAddr, reason: String },

    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Reference to one transfer inside one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    pub info_hash: InfoHash,
    /// Identity of the owning node when the transfer was added
    pub node: NodeId,
}

/// Point-in-time status of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub info_hash: InfoHash,
    pub state: TransferState,
    /// Fraction of content present, 0.0 to 1.0
    pub progress: f32,
    /// Bytes per second
    pub download_payload_rate: u64,
    /// Bytes per second
    pub upload_payload_rate: u64,
    pub num_peers: u32,
    pub connect_candidates: u32,
    pub error: Option<String>,
    pub has_metadata: bool,
    pub pieces_have: u32,
    pub piece_count: u32,
}

impl TransferStatus {
    /// Checks if every piece is present.
    pub fn is_complete(&self) -> bool {
        self.has_metadata && self.piece_count > 0 && self.pieces_have == self.piece_count
    }
}

/// One running engine instance driven by fixtures.
#[async_trait]
pub trait Node: Send + Sync {
    /// Short label used in log lines
    fn name(&self) -> &str;

    /// Identity currently presented to peers
    fn id(&self) -> NodeId;

    /// Applies a partial settings update.
    ///
    /// # Errors
    ///
    /// - `EngineError::SettingsRejected` - Engine refused a value
    async fn apply_settings(&self, settings: SettingsPack) -> Result<(), EngineError>;

    /// Replaces the peer-class filter.
    ///
    /// # Errors
    ///
    /// - `EngineError::SettingsRejected` - Engine refused the filter
    async fn set_peer_class_filter(&self, filter: PeerClassFilter) -> Result<(), EngineError>;

    /// Adds content and starts a transfer for it.
    ///
    /// # Errors
    ///
    /// - `EngineError::AddContentFailed` - Duplicate or unusable content
    async fn add_content(&self, params: AddContentParams) -> Result<TransferHandle, EngineError>;

    /// Handles of every transfer the node currently runs
    async fn transfers(&self) -> Vec<TransferHandle>;

    /// Returns the status of a transfer.
    ///
    /// # Errors
    ///
    /// - `EngineError::TransferNotFound` - Handle does not belong to this node
    async fn transfer_status(&self, handle: &TransferHandle) -> Result<TransferStatus, EngineError>;

    /// Plain TCP listen port, 0 when not listening
    fn listen_port(&self) -> u16;

    /// TLS listen port, 0 when the node has none
    fn tls_listen_port(&self) -> u16;

    /// Asks a transfer to connect to a remote peer.
    ///
    /// The result of the attempt is reported through events.
    ///
    /// # Errors
    ///
    /// - `EngineError::TransferNotFound` - Handle does not belong to this node
    async fn connect_peer(&self, handle: &TransferHandle, endpoint: SocketAddr)
    -> Result<(), EngineError>;

    /// Waits until at least one event is queued or `timeout` elapses.
    ///
    /// Returns true when events are available.
    async fn wait_for_events(&self, timeout: Duration) -> bool;

    /// Removes and returns every queued event in emission order.
    fn pop_events(&self) -> Vec<Event>;

    /// Requests a stats snapshot event.
    fn post_stats(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_roundtrip_and_errors() {
        let id = NodeId::new([0xab; 20]);
        assert_eq!(id.to_string(), "ab".repeat(20));
        assert_eq!(NodeId::from_hex(&"ab".repeat(20)).unwrap(), id);
        assert!(matches!(
            NodeId::from_hex("zz"),
            Err(EngineError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_status_completion() {
        let mut status = TransferStatus {
            info_hash: InfoHash::new([0u8; 20]),
            state: TransferState::Downloading,
            progress: 0.5,
            download_payload_rate: 0,
            upload_payload_rate: 0,
            num_peers: 1,
            connect_candidates: 0,
            error: None,
            has_metadata: true,
            pieces_have: 1,
            piece_count: 2,
        };
        assert!(!status.is_complete());
        status.pieces_have = 2;
        assert!(status.is_complete());
        status.has_metadata = false;
        assert!(!status.is_complete());
    }
}
