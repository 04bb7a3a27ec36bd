use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Result, TunnelError};

/// Network type accepted by the dialers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Any address family
    #[default]
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    /// Check if the given IP is usable on this network
    pub fn allows(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => ip.is_ipv4(),
            Network::Tcp6 => ip.is_ipv6(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

impl FromStr for Network {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(TunnelError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target or proxy address.
///
/// `host` is stored without IPv6 brackets; `Display` adds them back, so the
/// formatted value is always a valid `host:port` authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Hostname or IP address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Addr {
    /// Create a new Addr
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(Self::from(sock));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidAddress(format!("missing port in {}", s)))?;
        if host.is_empty() {
            return Err(TunnelError::InvalidAddress(format!("missing host in {}", s)));
        }
        // Unbracketed IPv6 literals are ambiguous
        if host.contains(':') && !host.starts_with('[') {
            return Err(TunnelError::InvalidAddress(format!(
                "too many colons in {}",
                s
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidAddress(format!("invalid port in {}", s)))?;
        Ok(Self::new(host, port))
    }

    /// Get the host as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Get the socket address if the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl FromStr for Addr {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Addr::parse(s)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
