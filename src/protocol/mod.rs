//! Message types and payloads carried over the wire
//!
//! Payloads are bincode-encoded. Tags not listed in [`MessageType`] are
//! application messages and are handed upward untouched.

use crate::error::{NetworkError, Result};
use crate::network::node::Endpoint;
use crate::utils::{deserialize, serialize};
use crate::wire::Message;

/// Version advertised during the handshake; peers must match exactly
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    RequestPeers = 1,
    ReturnPeers = 2,
    Block = 3,
    Transaction = 4,
    Announcement = 5,
    Disconnect = 6,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Handshake),
            1 => Some(MessageType::RequestPeers),
            2 => Some(MessageType::ReturnPeers),
            3 => Some(MessageType::Block),
            4 => Some(MessageType::Transaction),
            5 => Some(MessageType::Announcement),
            6 => Some(MessageType::Disconnect),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn message(self, payload: Vec<u8>) -> Message {
        Message::new(self.tag(), payload)
    }
}

fn expect_type(message: &Message, expected: MessageType) -> Result<()> {
    if message.msg_type != expected.tag() {
        return Err(NetworkError::Protocol(format!(
            "expected {expected:?} message, got type {}",
            message.msg_type
        )));
    }
    Ok(())
}

/// Ask a peer for up to `num_peers` addresses it knows
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RequestPeers {
    pub num_peers: u16,
}

impl RequestPeers {
    pub fn new(num_peers: usize) -> Self {
        Self {
            num_peers: num_peers.min(u16::MAX as usize) as u16,
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        Ok(MessageType::RequestPeers.message(serialize(self)?))
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        expect_type(message, MessageType::RequestPeers)?;
        deserialize(&message.payload)
    }
}

/// An advertised peer address
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct NodeAddress {
    pub address: String,
    pub port: u16,
}

impl From<&Endpoint> for NodeAddress {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            address: endpoint.host().to_string(),
            port: endpoint.port(),
        }
    }
}

impl From<&NodeAddress> for Endpoint {
    fn from(node: &NodeAddress) -> Self {
        Endpoint::new(node.address.clone(), node.port)
    }
}

/// Reply to [`RequestPeers`]
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ReturnPeers {
    pub peers: Vec<NodeAddress>,
}

impl ReturnPeers {
    pub fn new(endpoints: &[Endpoint]) -> Self {
        Self {
            peers: endpoints.iter().map(NodeAddress::from).collect(),
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.peers.iter().map(Endpoint::from).collect()
    }

    pub fn to_message(&self) -> Result<Message> {
        Ok(MessageType::ReturnPeers.message(serialize(self)?))
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        expect_type(message, MessageType::ReturnPeers)?;
        deserialize(&message.payload)
    }
}

/// The signed part of a handshake
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct HandshakeData {
    pub public_key: Vec<u8>,
    pub listening_port: u16,
    pub version: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Handshake {
    pub data: HandshakeData,
    /// ECDSA P-256 signature over the encoded `data`
    pub signature: Vec<u8>,
}

impl Handshake {
    pub fn to_message(&self) -> Result<Message> {
        Ok(MessageType::Handshake.message(serialize(self)?))
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        expect_type(message, MessageType::Handshake)?;
        deserialize(&message.payload)
    }
}

pub fn disconnect_message() -> Message {
    MessageType::Disconnect.message(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        for tag in 0..=6u8 {
            let ty = MessageType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
        assert_eq!(MessageType::from_tag(42), None);
    }

    #[test]
    fn test_return_peers_message() {
        let endpoints = vec![
            Endpoint::new("10.0.0.1", 6800),
            Endpoint::new("10.0.0.2", 6801),
        ];
        let message = ReturnPeers::new(&endpoints).to_message().unwrap();
        assert_eq!(message.msg_type, MessageType::ReturnPeers.tag());

        let decoded = ReturnPeers::from_message(&message).unwrap();
        assert_eq!(decoded.endpoints(), endpoints);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let message = RequestPeers::new(3).to_message().unwrap();
        assert!(matches!(
            ReturnPeers::from_message(&message),
            Err(NetworkError::Protocol(_))
        ));
    }

    #[test]
    fn test_request_peers_saturates() {
        assert_eq!(RequestPeers::new(100_000).num_peers, u16::MAX);
    }
}
