//! Port allocation under contention and exhaustion

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use swarmfix_core::config::PortConfig;
use swarmfix_core::network::{LeaseOwner, PortAllocator};
use swarmfix_core::{FixtureError, ServiceError, ServiceKind};

#[test]
fn test_leases_are_unique_and_in_range() {
    let config = PortConfig::default();
    let allocator = PortAllocator::new(config.clone());

    let mut seen = HashSet::new();
    for _ in 0..50 {
        let lease = allocator.allocate(LeaseOwner::Direct).unwrap();
        assert!(lease.port >= config.base);
        assert!(lease.port < config.base + config.span);
        assert!(seen.insert(lease.port), "port {} leased twice", lease.port);
    }
    assert_eq!(allocator.active_leases().len(), 50);

    for port in seen {
        assert!(allocator.release(port));
    }
    assert!(allocator.active_leases().is_empty());
}

#[test]
fn test_concurrent_allocation_never_collides() {
    let allocator = Arc::new(PortAllocator::default());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                (0..10)
                    .map(|_| allocator.allocate(LeaseOwner::Direct).unwrap().port)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for port in handle.join().unwrap() {
            assert!(all.insert(port), "port {port} handed out twice");
        }
    }
    assert_eq!(all.len(), 80);
}

#[test]
fn test_occupied_range_is_exhausted() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let allocator = PortAllocator::new(PortConfig {
        base: port,
        span: 1,
        max_probes: 4,
    });

    let error = allocator.allocate(LeaseOwner::Direct).unwrap_err();
    assert!(matches!(error, ServiceError::PortsExhausted { attempts: 4 }));
    assert!(FixtureError::from(error).is_fatal());
}

#[test]
fn test_service_leases_record_their_owner() {
    let allocator = PortAllocator::default();
    let lease = allocator
        .allocate(LeaseOwner::Service(ServiceKind::Socks5))
        .unwrap();

    assert!(allocator.is_leased(lease.port));
    let leases = allocator.active_leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].owner, LeaseOwner::Service(ServiceKind::Socks5));

    assert!(allocator.release(lease.port));
    assert!(!allocator.release(lease.port));
}
