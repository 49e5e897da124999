//! Peer-to-peer networking
//!
//! Dialing and listening, the signed handshake, individual peers with their
//! reconnect logic, the peer pool and the node server.

pub mod address_book;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod node;
pub mod peer;
pub mod pool;
pub mod server;

pub use address_book::{AddressBook, BUCKET_SIZE};
pub use connection::{Connector, Dialer, Direction, HandshakeConnector, Link, Listener};
pub use events::{NetworkEvent, PeerEvent, PeerId};
pub use handshake::Handshaker;
pub use node::{Endpoint, PeerIdentity};
pub use peer::{Peer, PeerConfig, PeerState};
pub use pool::{AddPeerOutcome, MaintenanceOutcome, MaintenanceReport, PeerPool, PoolConfig};
pub use server::{JobTarget, NetworkJob, NetworkServer};
