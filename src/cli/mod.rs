//! Command-line interface
//!
//! Argument parsing for the `peerwire` binary.

pub mod commands;

pub use commands::{Command, Opt};
