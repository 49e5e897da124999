use crate::error::{NetworkError, Result};
use crate::identity::short_key;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// A dialable `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to every socket address the host maps to
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| NetworkError::Io(format!("Failed to resolve {self}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(NetworkError::Io(format!("{self} resolved to no addresses")));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::Config(format!("Endpoint '{s}' is missing a port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NetworkError::Config(format!("Endpoint '{s}' is missing a host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| NetworkError::Config(format!("Invalid port in '{s}': {e}")))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Who a peer is, as established by its handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub public_key: Vec<u8>,
    pub listening_port: u16,
    pub protocol_version: u32,
}

impl PeerIdentity {
    pub fn short_id(&self) -> String {
        short_key(&self.public_key)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (v{})", self.short_id(), self.protocol_version)
    }
}
