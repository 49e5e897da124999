//! Data storage and persistence
//!
//! Peers the node has been connected to, kept in an embedded sled database.

pub mod peer_db;

pub use peer_db::{PeerDatabase, StoredPeer};
