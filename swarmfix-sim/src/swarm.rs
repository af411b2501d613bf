//! Registry of simulated nodes addressed by listen port

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use swarmfix_core::engine::Node;
use swarmfix_core::network::{LeaseOwner, PortAllocator};

use crate::SimError;
use crate::node::SimNode;

/// Port to node table shared by every node of a swarm.
///
/// Holds weak references only; a node leaves the table when its last strong
/// reference drops.
#[derive(Debug)]
pub(crate) struct SwarmRegistry {
    ports: Arc<PortAllocator>,
    nodes: Mutex<HashMap<u16, Weak<SimNode>>>,
}

impl SwarmRegistry {
    pub(crate) fn lookup(&self, port: u16) -> Option<Arc<SimNode>> {
        self.nodes.lock().get(&port).and_then(Weak::upgrade)
    }

    /// Forgets the node's ports and returns their leases.
    pub(crate) fn unregister(&self, ports: &[u16]) {
        let mut nodes = self.nodes.lock();
        for &port in ports.iter().filter(|&&port| port != 0) {
            nodes.remove(&port);
            self.ports.release(port);
        }
    }
}

/// Factory and address book for simulated nodes.
#[derive(Debug, Clone)]
pub struct SimSwarm {
    registry: Arc<SwarmRegistry>,
}

impl SimSwarm {
    /// Creates an empty swarm leasing listen ports from `ports`.
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            registry: Arc::new(SwarmRegistry {
                ports,
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts a node listening on a freshly leased port.
    ///
    /// With `tls` the node also listens on a second leased port reported as
    /// its TLS port. Listen events are queued immediately.
    ///
    /// # Errors
    ///
    /// - `SimError::Ports` - No free port could be leased
    pub fn spawn_node(&self, name: impl Into<String>, tls: bool) -> Result<Arc<SimNode>, SimError> {
        let listen_port = self.registry.ports.allocate(LeaseOwner::Direct)?.port;
        let tls_listen_port = if tls {
            match self.registry.ports.allocate(LeaseOwner::Direct) {
                Ok(lease) => lease.port,
                Err(e) => {
                    self.registry.ports.release(listen_port);
                    return Err(e.into());
                }
            }
        } else {
            0
        };

        let node = Arc::new(SimNode::new(
            name.into(),
            listen_port,
            tls_listen_port,
            Arc::clone(&self.registry),
        ));

        {
            let mut nodes = self.registry.nodes.lock();
            nodes.insert(listen_port, Arc::downgrade(&node));
            if tls_listen_port != 0 {
                nodes.insert(tls_listen_port, Arc::downgrade(&node));
            }
        }

        node.announce_listen();
        tracing::debug!(
            "Spawned simulated node {} on port {} (tls {})",
            node.name(),
            listen_port,
            tls_listen_port
        );
        Ok(node)
    }

    /// Starts `count` nodes named `node1`, `node2`, ...
    ///
    /// Returns the concrete nodes alongside trait objects for fixture calls.
    ///
    /// # Errors
    ///
    /// - `SimError::Ports` - No free port could be leased
    pub fn spawn_nodes(
        &self,
        count: usize,
        tls: bool,
    ) -> Result<(Vec<Arc<SimNode>>, Vec<Arc<dyn Node>>), SimError> {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            nodes.push(self.spawn_node(format!("node{}", i + 1), tls)?);
        }
        let dynamic = nodes
            .iter()
            .map(|node| Arc::clone(node) as Arc<dyn Node>)
            .collect();
        Ok((nodes, dynamic))
    }

    /// Finds the live node listening on `port`, plain or TLS.
    pub fn lookup(&self, port: u16) -> Option<Arc<SimNode>> {
        self.registry.lookup(port)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        // Upgraded handles must drop after the lock is released
        let live_nodes: Vec<Arc<SimNode>> = self
            .registry
            .nodes
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let mut live: Vec<u16> = live_nodes.iter().map(|node| node.listen_port()).collect();
        live.sort_unstable();
        live.dedup();
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_nodes_are_registered_by_port() {
        let ports = Arc::new(PortAllocator::default());
        let swarm = SimSwarm::new(Arc::clone(&ports));

        let node = swarm.spawn_node("node1", true).unwrap();
        assert_ne!(node.listen_port(), 0);
        assert_ne!(node.tls_listen_port(), 0);
        assert!(swarm.lookup(node.listen_port()).is_some());
        assert!(swarm.lookup(node.tls_listen_port()).is_some());
        assert_eq!(swarm.node_count(), 1);
        assert!(ports.is_leased(node.listen_port()));
    }

    #[test]
    fn test_dropped_node_releases_ports() {
        let ports = Arc::new(PortAllocator::default());
        let swarm = SimSwarm::new(Arc::clone(&ports));

        let node = swarm.spawn_node("node1", false).unwrap();
        let port = node.listen_port();
        drop(node);

        assert!(swarm.lookup(port).is_none());
        assert!(!ports.is_leased(port));
        assert_eq!(swarm.node_count(), 0);
    }

    #[test]
    fn test_spawn_nodes_names_in_order() {
        let swarm = SimSwarm::new(Arc::new(PortAllocator::default()));
        let (nodes, dynamic) = swarm.spawn_nodes(3, false).unwrap();
        assert_eq!(nodes[0].name(), "node1");
        assert_eq!(dynamic[2].name(), "node3");
    }
}
