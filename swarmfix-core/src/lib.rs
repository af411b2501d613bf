//! Swarmfix Core - Fixtures for integration-testing peer-to-peer transfer engines
//!
//! This crate drives several independent engine instances ("nodes") through
//! the [`engine::Node`] boundary: it feeds them deterministic content, wires
//! them into seed/leech topologies, observes their event streams, and runs the
//! short-lived helper services (proxies, web servers) some scenarios need.

pub mod config;
pub mod content;
pub mod engine;
pub mod fixture;
pub mod network;
pub mod replay;
pub mod services;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::FixtureConfig;
pub use content::{ContentDescriptor, ContentError, ContentGenerator, InfoHash, PieceIndex};
pub use engine::{EngineError, Event, EventKind, Node, NodeId, TransferHandle};
pub use fixture::{Fixture, Role, TestRun, TransferOptions, setup_transfer};
pub use replay::{ConsumePolicy, ReplayRegistry};
pub use services::{ServiceError, ServiceKind, ServiceManager, WebServerOptions};

/// Errors surfaced to the test assertion layer by fixture operations.
///
/// Timeouts are never represented here: waits report "not observed in time"
/// through `Option`/`bool` results instead.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Precondition violated: {reason}")]
    Precondition { reason: String },

    #[error("Duplicate node identity {id}")]
    DuplicateIdentity { id: NodeId },

    #[error("Node {node} reports identity {actual}, expected {expected}")]
    IdentityNotApplied {
        node: String,
        expected: NodeId,
        actual: NodeId,
    },

    #[error("{node}: {message}")]
    EngineReported { node: String, message: String },

    #[error("{node}: no listen event observed")]
    ListenNotObserved { node: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixtureError {
    /// Checks if this error must abort the whole test run.
    ///
    /// Resource exhaustion and precondition violations are fatal. Engine
    /// reported failures fail the current test but leave the driver running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FixtureError::Service(ServiceError::PortsExhausted { .. })
                | FixtureError::Service(ServiceError::SpawnFailed { .. })
                | FixtureError::Precondition { .. }
                | FixtureError::DuplicateIdentity { .. }
                | FixtureError::IdentityNotApplied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FixtureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let exhausted = FixtureError::Service(ServiceError::PortsExhausted { attempts: 10 });
        assert!(exhausted.is_fatal());

        let precondition = FixtureError::Precondition {
            reason: "one node".to_string(),
        };
        assert!(precondition.is_fatal());

        let reported = FixtureError::EngineReported {
            node: "node1".to_string(),
            message: "invalid piece request".to_string(),
        };
        assert!(!reported.is_fatal());
        assert_eq!(reported.to_string(), "node1: invalid piece request");
    }
}
