//! Error handling for the networking layer
//!
//! Every fallible operation in the crate returns [`NetworkError`]. Duplicate and
//! capacity conditions are their own variants so callers can match on them and
//! decide whether to ignore or log.

use std::fmt;

/// Result type alias for networking operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Error kinds raised by the networking layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Socket read/write or dial failure
    Io(String),
    /// A dial, handshake or write did not complete in time
    Timeout(String),
    /// Malformed frame, bad chunk sequence or unexpected message
    Protocol(String),
    /// Handshake rejected (self connection, known key, bad signature, version)
    Handshake(String),
    /// Operation requires a connected peer
    NotConnected(String),
    /// A peer with the same endpoint or public key is already in the pool
    DuplicatePeer(String),
    /// Key already present in a node store
    DuplicateKey(String),
    /// Node store reached its capacity
    StoreFull(String),
    /// Could not bind the listening socket
    Bind(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Key generation, signing or verification errors
    Crypto(String),
    /// Peer database errors
    Database(String),
    /// The component was stopped
    Shutdown,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(msg) => write!(f, "I/O error: {msg}"),
            NetworkError::Timeout(msg) => write!(f, "Timed out: {msg}"),
            NetworkError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            NetworkError::Handshake(msg) => write!(f, "Handshake rejected: {msg}"),
            NetworkError::NotConnected(peer) => write!(f, "Peer not connected: {peer}"),
            NetworkError::DuplicatePeer(peer) => write!(f, "Duplicate peer: {peer}"),
            NetworkError::DuplicateKey(key) => write!(f, "Duplicate key: {key}"),
            NetworkError::StoreFull(key) => write!(f, "Store full, cannot add: {key}"),
            NetworkError::Bind(msg) => write!(f, "Failed to bind listener: {msg}"),
            NetworkError::Config(msg) => write!(f, "Configuration error: {msg}"),
            NetworkError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            NetworkError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            NetworkError::Database(msg) => write!(f, "Database error: {msg}"),
            NetworkError::Shutdown => write!(f, "Network component has been shut down"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl NetworkError {
    /// Errors that end a connection but may be recovered by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(self, NetworkError::Io(_) | NetworkError::Timeout(_))
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                NetworkError::Timeout(err.to_string())
            }
            _ => NetworkError::Io(err.to_string()),
        }
    }
}

impl From<sled::Error> for NetworkError {
    fn from(err: sled::Error) -> Self {
        NetworkError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for NetworkError {
    fn from(err: bincode::error::EncodeError) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for NetworkError {
    fn from(err: bincode::error::DecodeError) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NetworkError {
    fn from(err: toml::de::Error) -> Self {
        NetworkError::Config(err.to_string())
    }
}
