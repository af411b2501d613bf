//! Loopback ports and synthetic peer addresses

pub mod addresses;
pub mod ports;

pub use addresses::{AddressGenerator, EndpointGenerator, loopback, parse_endpoint, random_v6};
pub use ports::{LeaseOwner, PortAllocator, PortLease};
