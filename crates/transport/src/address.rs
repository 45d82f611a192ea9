//! IPv4/IPv6 socket address with the NAT-classification predicates the
//! endpoint gatherer and connectivity checker need.
//!
//! Classification thresholds are taken from `rtc2::Address` (see
//! `examples/original_source/transport/rtc2/src/modules/network/address.cpp`):
//! loopback, link-local, private-network (RFC 1918 / `fd00::/8`), and
//! shared-network (`100.64.0.0/10`, carrier-grade NAT).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("could not parse address from {0:?}")]
    Parse(String),
}

/// A thin wrapper over `std::net::SocketAddr` adding the NAT-classification
/// predicates the original transport relies on for candidate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.0.set_port(port);
    }

    pub fn ip_to_string(&self) -> String {
        self.0.ip().to_string()
    }

    pub fn is_loopback(&self) -> bool {
        self.0.ip().is_loopback()
    }

    /// `169.254.0.0/16`, IPv6 `fe80::/10`.
    pub fn is_linklocal(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                let bits = u32::from(ip);
                (bits >> 16) == ((169u32 << 8) | 254)
            }
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                octets[0] == 0xFE && (octets[1] & 0xC0) == 0x80
            }
        }
    }

    /// `10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16`, IPv6 `fd00::/8`.
    pub fn is_private_network(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                let bits = u32::from(ip);
                (bits >> 24) == 10
                    || (bits >> 20) == ((172u32 << 4) | 1)
                    || (bits >> 16) == ((192u32 << 8) | 168)
            }
            IpAddr::V6(ip) => ip.octets()[0] == 0xFD,
        }
    }

    /// `100.64.0.0/10`, carrier-grade NAT shared address space. IPv4 only.
    pub fn is_shared_network(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                let bits = u32::from(ip);
                (bits >> 22) == ((100u32 << 2) | 1)
            }
            IpAddr::V6(_) => false,
        }
    }

    /// OR of all four classifications above.
    pub fn is_private(&self) -> bool {
        self.is_linklocal() || self.is_loopback() || self.is_private_network() || self.is_shared_network()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0.ip(), IpAddr::V4(_))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.0.ip(), IpAddr::V6(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.ip() {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.0.port()),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.0.port()),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Address)
            .map_err(|_| AddressError::Parse(s.to_string()))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address(addr)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<(Ipv4Addr, u16)> for Address {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Address(SocketAddr::new(IpAddr::V4(ip), port))
    }
}

impl From<(Ipv6Addr, u16)> for Address {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        Address(SocketAddr::new(IpAddr::V6(ip), port))
    }
}
