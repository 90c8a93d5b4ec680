//! # Endpoint Addresses
//!
//! A fixed-size endpoint identifier: a 16-byte IP (IPv4 addresses are stored
//! in IPv4-mapped IPv6 form) plus a UDP port. The all-zero address with port
//! zero means "any interface / ephemeral port".
//!
//! Hostname resolution is delegated to the system resolver; the core only
//! deals in literals.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// A transport endpoint: 16-byte IP representation plus port.
///
/// `Address` is a plain value type — copy it freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    ip: [u8; 16],
    port: u16,
}

impl Address {
    /// The wildcard address (`::`, port 0).
    pub fn any() -> Self {
        Address::default()
    }

    /// Build an address from an IP literal and port. Returns `None` for
    /// malformed literals.
    pub fn new(ip: &str, port: u16) -> Option<Self> {
        let mut addr = Address {
            ip: [0; 16],
            port,
        };
        if addr.set_ip(ip) {
            Some(addr)
        } else {
            None
        }
    }

    /// The port in host byte order.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Set the port.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Raw 16-byte IP representation (IPv4-mapped form for v4 addresses).
    pub fn ip_bytes(&self) -> &[u8; 16] {
        &self.ip
    }

    /// Parse an IP literal into this address.
    ///
    /// Accepts dotted-decimal IPv4 and colon-form IPv6, including `::`
    /// zero compression and IPv4-mapped IPv6. On failure the address is
    /// left unmodified and `false` is returned.
    pub fn set_ip(&mut self, literal: &str) -> bool {
        match literal.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                self.ip = v4.to_ipv6_mapped().octets();
                true
            }
            Ok(IpAddr::V6(v6)) => {
                self.ip = v6.octets();
                true
            }
            Err(_) => false,
        }
    }

    /// Format the IP as text. The wildcard address formats as `"::"`;
    /// IPv4-mapped addresses format as dotted decimal.
    pub fn get_ip(&self) -> String {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        }
    }

    /// Resolve a hostname through the system resolver and store the first
    /// returned address. Returns `false` when resolution fails.
    pub fn set_host(&mut self, host: &str) -> bool {
        // The port is irrelevant for resolution; ToSocketAddrs requires one.
        match (host, 0u16).to_socket_addrs() {
            Ok(mut iter) => match iter.next() {
                Some(sock) => {
                    match sock.ip() {
                        IpAddr::V4(v4) => self.ip = v4.to_ipv6_mapped().octets(),
                        IpAddr::V6(v6) => self.ip = v6.octets(),
                    }
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Textual host form. Reverse lookup is delegated to an external
    /// resolver; the core reports the IP literal.
    pub fn get_host(&self) -> String {
        self.get_ip()
    }

    /// Whether this is an IPv4 address in mapped form.
    pub fn is_v4(&self) -> bool {
        Ipv6Addr::from(self.ip).to_ipv4_mapped().is_some()
    }

    /// Convert to a socket address, preferring the IPv4 form for mapped
    /// addresses so it can be used with an IPv4-domain socket.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    /// Convert to a socket address in IPv6 form, for dual-stack sockets.
    pub fn to_socket_addr_v6(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::from(self.ip)), self.port)
    }

    /// Whether both addresses refer to the same interface (port ignored).
    pub fn same_host(&self, other: &Address) -> bool {
        self.ip == other.ip
    }
}

impl From<SocketAddr> for Address {
    fn from(sock: SocketAddr) -> Self {
        let ip = match sock.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Address {
            ip,
            port: sock.port(),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.to_socket_addr()
    }
}

impl From<(Ipv4Addr, u16)> for Address {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Address {
            ip: ip.to_ipv6_mapped().octets(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_v4() {
            write!(f, "{}:{}", self.get_ip(), self.port)
        } else {
            write!(f, "[{}]:{}", self.get_ip(), self.port)
        }
    }
}
