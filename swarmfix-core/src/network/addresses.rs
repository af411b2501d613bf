//! Deterministic fake peer addresses and endpoints
//!
//! Scenarios that inject peers into a node need addresses that look public
//! and never repeat within a run. Generators are plain values so every test
//! owns its own sequence.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const INITIAL_ADDRESS: u32 = 0x9234_3023;
const ADDRESS_STEP: u32 = 0x0030_80ca;
const FIRST_ENDPOINT_PORT: u16 = 1024;
const TCP_PORT_CYCLE: u16 = 14038;
const UDP_PORT_CYCLE: u16 = 14037;

/// Sequence of public-looking IPv4 addresses.
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    current: u32,
}

impl Default for AddressGenerator {
    fn default() -> Self {
        Self {
            current: INITIAL_ADDRESS,
        }
    }
}

impl AddressGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts the sequence from its first value.
    pub fn reset(&mut self) {
        self.current = INITIAL_ADDRESS;
    }

    /// Next address that is not unspecified, private, link-local or loopback.
    pub fn next_v4(&mut self) -> Ipv4Addr {
        loop {
            self.current = self.current.wrapping_add(ADDRESS_STEP);
            let addr = Ipv4Addr::from(self.current);
            if !(addr.is_unspecified()
                || addr.is_private()
                || addr.is_link_local()
                || addr.is_loopback())
            {
                return addr;
            }
        }
    }
}

/// Uniformly random IPv6 address.
pub fn random_v6() -> Ipv6Addr {
    Ipv6Addr::from(rand::random::<[u8; 16]>())
}

/// Produces endpoints whose ports do not repeat within a cycle.
#[derive(Debug, Clone, Default)]
pub struct EndpointGenerator {
    addresses: AddressGenerator,
    counter: u16,
}

impl EndpointGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next TCP endpoint on a generated IPv4 address.
    pub fn next_tcp(&mut self) -> SocketAddr {
        self.counter = (self.counter + 1) % TCP_PORT_CYCLE;
        SocketAddr::new(
            IpAddr::V4(self.addresses.next_v4()),
            self.counter + FIRST_ENDPOINT_PORT,
        )
    }

    /// Next UDP endpoint on a generated IPv4 address.
    pub fn next_udp(&mut self) -> SocketAddr {
        self.counter = (self.counter + 1) % UDP_PORT_CYCLE;
        SocketAddr::new(
            IpAddr::V4(self.addresses.next_v4()),
            self.counter + FIRST_ENDPOINT_PORT,
        )
    }

    /// Next TCP endpoint on a random IPv6 address.
    pub fn next_tcp_v6(&mut self) -> SocketAddr {
        self.counter = (self.counter + 1) % TCP_PORT_CYCLE;
        SocketAddr::new(IpAddr::V6(random_v6()), self.counter + FIRST_ENDPOINT_PORT)
    }
}

/// Parses an `ip` and port into an endpoint.
///
/// # Errors
///
/// - `std::net::AddrParseError` - `ip` is not a valid address
pub fn parse_endpoint(ip: &str, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
    let addr: IpAddr = ip.parse()?;
    Ok(SocketAddr::new(addr, port))
}

/// Loopback endpoint for a local listen port.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}
