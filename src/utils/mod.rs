//! Utility functions and helpers
//!
//! Cryptographic primitives for node keys and handshakes, and the bincode
//! helpers used for protocol payloads.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, public_key_from_pkcs8,
};

pub use serialization::{deserialize, serialize};
