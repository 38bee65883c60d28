//! Shared address and network primitives.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport network of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination host: either a not-yet-resolved FQDN or an address literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Fqdn(String),
    Ip(IpAddr),
}

/// A dial destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: Host,
    pub port: u16,
}

impl Destination {
    pub fn fqdn(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Host::Fqdn(host.into()),
            port,
        }
    }

    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: Host::Ip(addr),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::ip(addr.ip(), addr.port())
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self.host, Host::Fqdn(_))
    }

    /// Host part without the port.
    pub fn addr_string(&self) -> String {
        match &self.host {
            Host::Fqdn(fqdn) => fqdn.clone(),
            Host::Ip(ip) => ip.to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Fqdn(fqdn) => write!(f, "{}:{}", fqdn, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}
