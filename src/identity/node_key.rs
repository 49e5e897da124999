use crate::error::{NetworkError, Result};
use crate::utils::{ecdsa_p256_sha256_sign_digest, new_key_pair, public_key_from_pkcs8};
use log::info;
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// This node's signing identity.
///
/// The PKCS#8 document is wiped from memory when the key is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NodeKey {
    pkcs8: Vec<u8>,
    #[zeroize(skip)]
    public_key: Vec<u8>,
}

impl NodeKey {
    pub fn generate() -> Result<NodeKey> {
        let pkcs8 = new_key_pair()?;
        Self::from_pkcs8(pkcs8)
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<NodeKey> {
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(NodeKey { pkcs8, public_key })
    }

    pub fn public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    /// Short hex prefix of the public key, for logs
    pub fn short_id(&self) -> String {
        short_key(&self.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        ecdsa_p256_sha256_sign_digest(&self.pkcs8, message)
    }

    /// Load a hex-encoded PKCS#8 key file
    pub fn load(path: &Path) -> Result<NodeKey> {
        let contents = fs::read_to_string(path)
            .map_err(|e| NetworkError::Crypto(format!("Failed to read {}: {e}", path.display())))?;
        let pkcs8 = hex::decode(contents.trim())
            .map_err(|e| NetworkError::Crypto(format!("Invalid key file {}: {e}", path.display())))?;
        Self::from_pkcs8(pkcs8)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| NetworkError::Io(format!("Failed to create {}: {e}", parent.display())))?;
            }
        }
        fs::write(path, hex::encode(&self.pkcs8))
            .map_err(|e| NetworkError::Io(format!("Failed to write {}: {e}", path.display())))
    }

    /// Load the key at `path`, generating and saving a new one if absent
    pub fn load_or_generate(path: &Path) -> Result<NodeKey> {
        if path.exists() {
            return Self::load(path);
        }
        let key = Self::generate()?;
        key.save(path)?;
        info!("Generated new node key {} at {}", key.short_id(), path.display());
        Ok(key)
    }
}

pub fn short_key(public_key: &[u8]) -> String {
    let prefix = &public_key[..public_key.len().min(6)];
    hex::encode(prefix)
}
