//! Typed events flowing upward: peer → pool, and pool → application

use crate::error::NetworkError;
use crate::network::node::Endpoint;
use crate::wire::Message;

/// Pool-assigned peer handle; increases with every added peer
pub type PeerId = u64;

/// Raised by a peer to its pool
#[derive(Debug)]
pub enum PeerEvent {
    Message { peer: PeerId, message: Message },
    /// Link re-established after a dropped connection
    Reconnected { peer: PeerId },
    /// Reconnect attempts exhausted; the peer is now disconnected
    Unreachable { peer: PeerId, cause: NetworkError },
}

/// Raised by the pool to the application layer
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    MessageReceived {
        peer: PeerId,
        endpoint: Endpoint,
        message: Message,
    },
    PeerConnected {
        peer: PeerId,
        endpoint: Endpoint,
    },
    PeerDisconnected {
        peer: PeerId,
        endpoint: Endpoint,
    },
}
