//! Node identity
//!
//! The ECDSA key that authenticates this node in handshakes.

pub mod node_key;

pub use node_key::{short_key, NodeKey};
