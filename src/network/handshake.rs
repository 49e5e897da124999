//! Authenticated handshake exchanged once per connection
//!
//! The dialing side writes its handshake first and then reads the reply. The
//! accepting side reads, verifies and runs the pool's admission check before
//! answering; a rejected dialer simply sees the connection close.

use crate::error::{NetworkError, Result};
use crate::identity::NodeKey;
use crate::network::node::PeerIdentity;
use crate::protocol::{Handshake, HandshakeData, PROTOCOL_VERSION};
use crate::utils::{current_timestamp, ecdsa_p256_sha256_sign_verify, serialize};
use crate::wire::{encode, read_frame, Frame};
use log::debug;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_HANDSHAKE_LEN: usize = 4096;

#[derive(Clone)]
pub struct Handshaker {
    key: Arc<NodeKey>,
    listening_port: u16,
    version: u32,
}

impl Handshaker {
    pub fn new(key: Arc<NodeKey>, listening_port: u16) -> Self {
        Self {
            key,
            listening_port,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn public_key(&self) -> &[u8] {
        self.key.public_key()
    }

    pub fn listening_port(&self) -> u16 {
        self.listening_port
    }

    pub fn build(&self) -> Result<Handshake> {
        let data = HandshakeData {
            public_key: self.key.public_key().to_vec(),
            listening_port: self.listening_port,
            version: self.version,
            timestamp: current_timestamp()?,
        };
        let signature = self.key.sign(&serialize(&data)?)?;
        Ok(Handshake { data, signature })
    }

    /// Check a remote handshake and extract the identity it claims
    pub fn verify(&self, handshake: &Handshake) -> Result<PeerIdentity> {
        let data = &handshake.data;
        if data.public_key == self.key.public_key() {
            return Err(NetworkError::Handshake(
                "remote presented our own public key".to_string(),
            ));
        }
        if data.version != self.version {
            return Err(NetworkError::Handshake(format!(
                "protocol version {} does not match ours ({})",
                data.version, self.version
            )));
        }
        if !ecdsa_p256_sha256_sign_verify(&data.public_key, &handshake.signature, &serialize(data)?)
        {
            return Err(NetworkError::Handshake("invalid signature".to_string()));
        }

        Ok(PeerIdentity {
            public_key: data.public_key.clone(),
            listening_port: data.listening_port,
            protocol_version: data.version,
        })
    }

    /// Dialing side: send ours, then read and verify theirs
    pub fn initiate<S: Read + Write>(&self, stream: &mut S) -> Result<PeerIdentity> {
        write_handshake(stream, &self.build()?)?;
        let identity = self.verify(&read_handshake(stream)?)?;
        debug!("Handshake completed with {identity}");
        Ok(identity)
    }

    /// Accepting side: read theirs, admit it, then answer
    pub fn respond<S, F>(&self, stream: &mut S, admit: F) -> Result<PeerIdentity>
    where
        S: Read + Write,
        F: FnOnce(&PeerIdentity) -> Result<()>,
    {
        let identity = self.verify(&read_handshake(stream)?)?;
        admit(&identity)?;
        write_handshake(stream, &self.build()?)?;
        debug!("Accepted handshake from {identity}");
        Ok(identity)
    }
}

fn write_handshake<S: Write>(stream: &mut S, handshake: &Handshake) -> Result<()> {
    stream.write_all(&encode(&handshake.to_message()?)?)?;
    stream.flush()?;
    Ok(())
}

fn read_handshake<S: Read>(stream: &mut S) -> Result<Handshake> {
    match read_frame(stream)? {
        Frame::Whole(message) if message.len() <= MAX_HANDSHAKE_LEN => {
            Handshake::from_message(&message)
        }
        Frame::Whole(message) => Err(NetworkError::Protocol(format!(
            "handshake of {} bytes is too large",
            message.len()
        ))),
        Frame::Partial { .. } => Err(NetworkError::Protocol(
            "handshake must not be chunked".to_string(),
        )),
    }
}
