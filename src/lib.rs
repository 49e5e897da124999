//! # peerwire
//!
//! The peer-to-peer layer of a blockchain node: length-prefixed framing with
//! chunking for large messages, threaded stream readers and writers, peers
//! that reconnect on their own, and a pool that keeps the node connected to
//! roughly a target number of peers.
//!
//! ## Layout
//! - `wire/`: frame codec, stream reader (chunk reassembly) and writer queue
//! - `protocol/`: message tags and the handshake and peer-exchange payloads
//! - `network/`: endpoints, dialing and listening, handshake, peer, pool and
//!   the node server that ties the threads together
//! - `identity/`: the node's ECDSA key
//! - `storage/`: sled-backed memory of known peers
//! - `config/`: TOML settings with environment overrides
//! - `utils/`: crypto and bincode helpers
//! - `cli/`: arguments for the `peerwire` binary
//!
//! ## Threads
//! Every peer owns a reader, a writer and a supervisor thread. A node adds
//! an accept thread, a pool event thread, a job dispatch thread and a
//! maintenance timer. Everything talks over `crossbeam-channel`.
//!
//! When a link drops, only the side that dialed redials. The other side keeps
//! its peer waiting and hands it the new inbound connection, so both ends
//! keep their peer ids.

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod utils;
pub mod wire;

pub use cli::{Command, Opt};
pub use config::NetworkConfig;
pub use error::{NetworkError, Result};
pub use identity::NodeKey;
pub use network::{
    AddPeerOutcome, AddressBook, Connector, Dialer, Direction, Endpoint, HandshakeConnector,
    Handshaker, JobTarget, Link, Listener, MaintenanceOutcome, MaintenanceReport, NetworkEvent,
    NetworkJob, NetworkServer, Peer, PeerConfig, PeerEvent, PeerId, PeerIdentity, PeerPool,
    PeerState, PoolConfig,
};
pub use protocol::{MessageType, RequestPeers, ReturnPeers, PROTOCOL_VERSION};
pub use storage::{PeerDatabase, StoredPeer};
pub use wire::{Message, SendCallback};
