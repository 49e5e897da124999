use crate::error::{NetworkError, Result};
use crate::network::node::Endpoint;
use crate::network::peer::PeerConfig;
use crate::network::pool::PoolConfig;
use crate::wire::MAX_FRAME_LENGTH;
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const NODE_PORT_KEY: &str = "NODE_PORT";

pub const DEFAULT_LISTEN_PORT: u16 = 6800;

/// Node networking settings, read from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Host advertised to peers; defaults to `listen_host`
    pub advertised_host: Option<String>,
    pub target_peer_count: usize,
    pub bootnodes: Vec<String>,
    /// Dialed once at startup
    pub peers: Vec<String>,
    pub dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub maintenance_period_secs: u64,
    pub initial_maintenance_delay_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_chunk_size: usize,
    pub address_book_capacity: usize,
    pub data_dir: PathBuf,
    pub key_file: String,
    pub persist_peers: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            advertised_host: None,
            target_peer_count: 8,
            bootnodes: vec!["127.0.0.1:6789".to_string(), "127.0.0.1:6788".to_string()],
            peers: Vec::new(),
            dial_timeout_ms: 3000,
            handshake_timeout_ms: 5000,
            maintenance_period_secs: 60,
            initial_maintenance_delay_secs: 0,
            reconnect_attempts: 3,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 10_000,
            max_chunk_size: 64 * 1024,
            address_book_capacity: 20,
            data_dir: PathBuf::from("data"),
            key_file: "node.key".to_string(),
            persist_peers: true,
        }
    }
}

impl NetworkConfig {
    /// Read a TOML file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<NetworkConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            NetworkError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!("Loaded network config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<NetworkConfig> {
        Ok(toml::from_str(text)?)
    }

    /// `NODE_ADDRESS` (host or host:port) and `NODE_PORT` replace the listen address
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(address) = env::var(NODE_ADDRESS_KEY) {
            self.apply_address_override(&address)?;
        }
        if let Ok(port) = env::var(NODE_PORT_KEY) {
            self.listen_port = port
                .parse()
                .map_err(|_| NetworkError::Config(format!("{NODE_PORT_KEY}={port} is not a port")))?;
        }
        Ok(())
    }

    fn apply_address_override(&mut self, address: &str) -> Result<()> {
        match address.parse::<Endpoint>() {
            Ok(endpoint) => {
                self.listen_host = endpoint.host().to_string();
                self.listen_port = endpoint.port();
            }
            Err(_) if !address.is_empty() => self.listen_host = address.to_string(),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_peer_count == 0 {
            return Err(NetworkError::Config(
                "target_peer_count must be greater than 0".to_string(),
            ));
        }
        let timeouts = [
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("maintenance_period_secs", self.maintenance_period_secs),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(NetworkError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_FRAME_LENGTH {
            return Err(NetworkError::Config(format!(
                "max_chunk_size must be between 1 and {MAX_FRAME_LENGTH}"
            )));
        }
        self.bootnode_endpoints()?;
        self.static_peer_endpoints()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        Endpoint::new(self.listen_host.clone(), self.listen_port).to_string()
    }

    pub fn bootnode_endpoints(&self) -> Result<Vec<Endpoint>> {
        parse_endpoints(&self.bootnodes)
    }

    pub fn static_peer_endpoints(&self) -> Result<Vec<Endpoint>> {
        parse_endpoints(&self.peers)
    }

    /// Host other nodes should dial
    pub fn advertised_host(&self) -> &str {
        match &self.advertised_host {
            Some(host) => host,
            None => &self.listen_host,
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(&self.key_file)
    }

    pub fn peer_db_path(&self) -> PathBuf {
        self.data_dir.join("peers")
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn maintenance_period(&self) -> Duration {
        Duration::from_secs(self.maintenance_period_secs)
    }

    pub fn initial_maintenance_delay(&self) -> Duration {
        Duration::from_secs(self.initial_maintenance_delay_secs)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(
                self.max_reconnect_delay_ms.max(self.reconnect_delay_ms),
            ),
            chunk_size: self.max_chunk_size,
        }
    }

    /// Pool settings; `self_endpoint` is our advertised host with the bound port
    pub fn pool_config(&self, bound_port: u16) -> Result<PoolConfig> {
        Ok(PoolConfig {
            target_peer_count: self.target_peer_count,
            bootnodes: self.bootnode_endpoints()?,
            self_endpoint: Some(Endpoint::new(self.advertised_host(), bound_port)),
            peer: self.peer_config(),
            request_timeout: self.dial_timeout(),
            address_book_capacity: self.address_book_capacity,
            ..PoolConfig::default()
        })
    }
}

fn parse_endpoints(entries: &[String]) -> Result<Vec<Endpoint>> {
    entries.iter().map(|entry| entry.parse()).collect()
}
