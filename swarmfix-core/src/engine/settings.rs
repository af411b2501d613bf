//! Configuration values pushed into nodes

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use super::NodeId;
use super::events::EventKind;
use crate::content::{ContentDescriptor, InfoHash};

/// Peer class every peer belongs to when the global filter is installed.
pub const GLOBAL_PEER_CLASS: u32 = 0;

/// Bitmask selecting which event categories a node emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const ERROR: EventMask = EventMask(1);
    pub const PEER: EventMask = EventMask(1 << 1);
    pub const STATUS: EventMask = EventMask(1 << 2);
    pub const PROGRESS: EventMask = EventMask(1 << 3);
    pub const ALL: EventMask = EventMask(0b1111);

    /// Removes the categories in `other`.
    pub fn without(self, other: EventMask) -> Self {
        EventMask(self.0 & !other.0)
    }

    /// Category an event kind belongs to.
    pub fn category_of(kind: EventKind) -> EventMask {
        match kind {
            EventKind::PieceFinished | EventKind::BlockFinished | EventKind::BlockDownloading => {
                EventMask::PROGRESS
            }
            EventKind::PeerConnected | EventKind::PeerDisconnected | EventKind::PeerLog => {
                EventMask::PEER
            }
            EventKind::ListenFailed
            | EventKind::InvalidRequest
            | EventKind::FastresumeRejected
            | EventKind::HashFailed => EventMask::ERROR,
            EventKind::ListenSucceeded
            | EventKind::TransferAdded
            | EventKind::StateChanged
            | EventKind::MetadataReceived
            | EventKind::TransferFinished
            | EventKind::StatsSnapshot => EventMask::STATUS,
        }
    }

    /// Checks whether events of `kind` pass this mask.
    pub fn allows(self, kind: EventKind) -> bool {
        self.0 & Self::category_of(kind).0 != 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ERROR
    }
}

/// How a node balances TCP against other transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedMode {
    PreferTcp,
    PeerProportional,
}

/// Partial settings update; `None` leaves a value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPack {
    /// Identity the node must adopt
    pub peer_fingerprint: Option<NodeId>,
    /// Local service discovery broadcasts
    pub enable_lsd: Option<bool>,
    pub event_mask: Option<EventMask>,
    pub allow_multiple_connections_per_ip: Option<bool>,
    pub mixed_mode: Option<MixedMode>,
    /// Failed connection attempts before a peer is dropped
    pub max_failcount: Option<u32>,
}

impl SettingsPack {
    /// Overlays every value set in `other` onto `self`.
    pub fn merge(&mut self, other: &SettingsPack) {
        if other.peer_fingerprint.is_some() {
            self.peer_fingerprint = other.peer_fingerprint;
        }
        if other.enable_lsd.is_some() {
            self.enable_lsd = other.enable_lsd;
        }
        if other.event_mask.is_some() {
            self.event_mask = other.event_mask;
        }
        if other.allow_multiple_connections_per_ip.is_some() {
            self.allow_multiple_connections_per_ip = other.allow_multiple_connections_per_ip;
        }
        if other.mixed_mode.is_some() {
            self.mixed_mode = other.mixed_mode;
        }
        if other.max_failcount.is_some() {
            self.max_failcount = other.max_failcount;
        }
    }
}

/// One IPv4 range mapped to a peer-class bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClassRule {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    pub classes: u32,
}

/// Ordered IPv4 range rules assigning peers to classes.
///
/// When ranges overlap, the rule added last wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerClassFilter {
    rules: Vec<PeerClassRule>,
}

impl PeerClassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter placing every IPv4 peer in the global class.
    pub fn global() -> Self {
        let mut filter = Self::new();
        filter.add_rule(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            1 << GLOBAL_PEER_CLASS,
        );
        filter
    }

    pub fn add_rule(&mut self, first: Ipv4Addr, last: Ipv4Addr, classes: u32) {
        self.rules.push(PeerClassRule {
            first,
            last,
            classes,
        });
    }

    pub fn rules(&self) -> &[PeerClassRule] {
        &self.rules
    }

    /// Class bitmask for an address, zero when no rule covers it.
    pub fn classes_for(&self, addr: Ipv4Addr) -> u32 {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.first <= addr && addr <= rule.last)
            .map_or(0, |rule| rule.classes)
    }
}

/// Where a node gets the description of added content from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// Full metadata known up front
    Metadata(Arc<ContentDescriptor>),
    /// Only the identifier; metadata must be fetched from peers
    InfoHash(InfoHash),
}

impl ContentSource {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            ContentSource::Metadata(descriptor) => descriptor.info_hash,
            ContentSource::InfoHash(info_hash) => *info_hash,
        }
    }
}

/// Per-transfer behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFlags {
    /// Assume all data is present without checking it
    pub seed_mode: bool,
    pub paused: bool,
    pub auto_managed: bool,
    pub super_seeding: bool,
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self {
            seed_mode: false,
            paused: true,
            auto_managed: true,
            super_seeding: false,
        }
    }
}

/// Arguments of a node's add-content call.
#[derive(Debug, Clone)]
pub struct AddContentParams {
    pub source: ContentSource,
    pub save_path: PathBuf,
    pub flags: TransferFlags,
}

impl AddContentParams {
    pub fn new(source: ContentSource, save_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            save_path: save_path.into(),
            flags: TransferFlags::default(),
        }
    }

    /// Adds content with full metadata, active immediately.
    pub fn with_metadata(descriptor: Arc<ContentDescriptor>, save_path: impl Into<PathBuf>) -> Self {
        let mut params = Self::new(ContentSource::Metadata(descriptor), save_path);
        params.flags.paused = false;
        params.flags.auto_managed = false;
        params
    }

    pub fn info_hash(&self) -> InfoHash {
        self.source.info_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_filter_covers_every_address() {
        let filter = PeerClassFilter::global();
        assert_eq!(filter.classes_for(Ipv4Addr::LOCALHOST), 1);
        assert_eq!(filter.classes_for(Ipv4Addr::new(8, 8, 8, 8)), 1);
        assert_eq!(filter.classes_for(Ipv4Addr::BROADCAST), 1);
    }

    #[test]
    fn test_last_rule_wins() {
        let mut filter = PeerClassFilter::global();
        filter.add_rule(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 255, 255, 255), 0b110);
        assert_eq!(filter.classes_for(Ipv4Addr::new(10, 1, 2, 3)), 0b110);
        assert_eq!(filter.classes_for(Ipv4Addr::new(11, 0, 0, 0)), 1);
        assert_eq!(PeerClassFilter::new().classes_for(Ipv4Addr::LOCALHOST), 0);
    }

    #[test]
    fn test_mask_without_progress() {
        let mask = EventMask::ALL.without(EventMask::PROGRESS);
        assert!(!mask.allows(EventKind::PieceFinished));
        assert!(!mask.allows(EventKind::BlockFinished));
        assert!(mask.allows(EventKind::StateChanged));
        assert!(mask.allows(EventKind::PeerDisconnected));
        assert!(mask.allows(EventKind::InvalidRequest));
        assert!(mask.allows(EventKind::StatsSnapshot));
    }

    #[test]
    fn test_settings_merge_overlays_set_values() {
        let mut base = SettingsPack {
            enable_lsd: Some(true),
            max_failcount: Some(3),
            ..SettingsPack::default()
        };
        base.merge(&SettingsPack {
            enable_lsd: Some(false),
            ..SettingsPack::default()
        });
        assert_eq!(base.enable_lsd, Some(false));
        assert_eq!(base.max_failcount, Some(3));
    }

    #[test]
    fn test_default_flags_paused_and_managed() {
        let flags = TransferFlags::default();
        assert!(flags.paused);
        assert!(flags.auto_managed);
        assert!(!flags.seed_mode);
    }
}
