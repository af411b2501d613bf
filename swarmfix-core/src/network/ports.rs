//! Ephemeral loopback port allocation

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};

use parking_lot::Mutex;

use crate::config::PortConfig;
use crate::services::{ServiceError, ServiceKind};

/// Who holds a leased port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOwner {
    Service(ServiceKind),
    /// Used directly by a test or a node
    Direct,
}

/// Port handed out by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub owner: LeaseOwner,
}

/// Finds bindable loopback TCP ports that no other lease in this process holds.
///
/// A port is probed by binding `127.0.0.1:<port>` and releasing the socket
/// immediately, so another process may still grab it before the lease holder
/// binds. Concurrent test binaries must use disjoint ranges.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortConfig,
    leases: Mutex<BTreeMap<u16, LeaseOwner>>,
}

impl PortAllocator {
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            leases: Mutex::new(BTreeMap::new()),
        }
    }

    /// Leases a free port.
    ///
    /// Starts at a random offset in the configured range and walks upwards,
    /// wrapping at the end of the range, until a probe succeeds.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortsExhausted` - No free port within the probe ceiling
    pub fn allocate(&self, owner: LeaseOwner) -> Result<PortLease, ServiceError> {
        let span = self.config.span.max(1);
        let mut offset = rand::random_range(0..span);
        let mut leases = self.leases.lock();

        for _ in 0..self.config.max_probes {
            offset = (offset + 1) % span;
            let Some(port) = self.config.base.checked_add(offset) else {
                continue;
            };
            if port == 0 || leases.contains_key(&port) {
                continue;
            }

            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    drop(listener);
                    tracing::debug!("Leased port {} to {:?}", port, owner);
                    leases.insert(port, owner.clone());
                    return Ok(PortLease { port, owner });
                }
                Err(e) => {
                    tracing::trace!("Port {} unavailable: {}", port, e);
                }
            }
        }

        tracing::error!(
            "No free port in {}..{} after {} probes",
            self.config.base,
            u32::from(self.config.base) + u32::from(span),
            self.config.max_probes
        );
        Err(ServiceError::PortsExhausted {
            attempts: self.config.max_probes,
        })
    }

    /// Returns a port to the pool. Returns false if it was not leased.
    pub fn release(&self, port: u16) -> bool {
        let released = self.leases.lock().remove(&port).is_some();
        if released {
            tracing::debug!("Released port {}", port);
        }
        released
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leases.lock().contains_key(&port)
    }

    /// Snapshot of every active lease, ordered by port.
    pub fn active_leases(&self) -> Vec<PortLease> {
        self.leases
            .lock()
            .iter()
            .map(|(port, owner)| PortLease {
                port: *port,
                owner: owner.clone(),
            })
            .collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_allocations_are_distinct_while_active() {
        let allocator = PortAllocator::default();
        let mut seen = HashSet::new();

        for _ in 0..50 {
            let lease = allocator.allocate(LeaseOwner::Direct).unwrap();
            assert!(lease.port >= 2000 && lease.port < 8000);
            assert!(seen.insert(lease.port), "port {} handed out twice", lease.port);
        }
        assert_eq!(allocator.active_leases().len(), 50);
    }

    #[test]
    fn test_release_makes_port_available() {
        let allocator = PortAllocator::new(PortConfig {
            base: 20_000,
            span: 1,
            max_probes: 8,
        });

        let lease = allocator.allocate(LeaseOwner::Direct);
        // Another process may hold the single candidate
        let Ok(lease) = lease else { return };

        assert!(allocator.is_leased(lease.port));
        assert!(matches!(
            allocator.allocate(LeaseOwner::Direct),
            Err(ServiceError::PortsExhausted { attempts: 8 })
        ));

        assert!(allocator.release(lease.port));
        assert!(!allocator.release(lease.port));
        assert_eq!(allocator.allocate(LeaseOwner::Direct).unwrap().port, lease.port);
    }

    #[test]
    fn test_occupied_port_is_skipped() {
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = occupied.local_addr().unwrap().port();

        let allocator = PortAllocator::new(PortConfig {
            base: port,
            span: 1,
            max_probes: 16,
        });
        assert!(matches!(
            allocator.allocate(LeaseOwner::Service(ServiceKind::Http)),
            Err(ServiceError::PortsExhausted { attempts: 16 })
        ));
        assert!(allocator.active_leases().is_empty());
    }
}
