//! Configuration management
//!
//! Node networking settings loaded from a TOML file, with environment
//! overrides for the listen address.

pub mod settings;

pub use settings::{NetworkConfig, DEFAULT_LISTEN_PORT};
