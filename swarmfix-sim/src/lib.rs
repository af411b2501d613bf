//! Swarmfix Sim - In-process engine nodes for exercising fixtures
//!
//! Every [`SimNode`] implements [`swarmfix_core::Node`] without touching the
//! network: nodes find each other through the [`SimSwarm`] registry by their
//! leased loopback ports, exchange metadata and pieces through tokio tasks,
//! and read and write real files below their save paths. Fixture code cannot
//! tell a simulated node from a real engine binding, so the whole setup,
//! replay and observation flow can run inside `cargo test`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use swarmfix_core::network::PortAllocator;
//! use swarmfix_sim::SimSwarm;
//!
//! # fn main() -> Result<(), swarmfix_sim::SimError> {
//! let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
//! let (_nodes, dynamic) = swarm.spawn_nodes(2, false)?;
//! assert_eq!(dynamic.len(), 2);
//! # Ok(())
//! # }
//! ```

mod exchange;
pub mod node;
pub mod queue;
pub mod swarm;

pub use node::SimNode;
pub use queue::EventQueue;
pub use swarm::SimSwarm;
use swarmfix_core::ServiceError;

/// Errors raised while building a simulated swarm.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("No listen port available: {0}")]
    Ports(#[from] ServiceError),
}
