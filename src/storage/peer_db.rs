use crate::error::{NetworkError, Result};
use crate::network::node::Endpoint;
use crate::utils::{current_timestamp, deserialize, serialize};
use bincode::{Decode, Encode};
use log::debug;
use std::path::Path;

const PEERS_TREE: &str = "peers";

/// A remembered peer, keyed on disk by its endpoint string
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPeer {
    pub endpoint: Endpoint,
    /// Unix millis of the last time the peer joined the pool
    pub last_seen: i64,
}

/// Endpoints of peers we have been connected to, persisted across restarts
#[derive(Clone)]
pub struct PeerDatabase {
    db: sled::Db,
    tree: sled::Tree,
}

impl PeerDatabase {
    pub fn open(path: &Path) -> Result<PeerDatabase> {
        let db = sled::open(path).map_err(|e| {
            NetworkError::Database(format!("Failed to open peer database {}: {e}", path.display()))
        })?;
        let tree = db
            .open_tree(PEERS_TREE)
            .map_err(|e| NetworkError::Database(format!("Failed to open peers tree: {e}")))?;
        Ok(PeerDatabase { db, tree })
    }

    /// All stored peers, ordered by endpoint key
    pub fn read_peers(&self) -> Result<Vec<StoredPeer>> {
        let mut peers = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            peers.push(deserialize::<StoredPeer>(&value)?);
        }
        Ok(peers)
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.read_peers()?.into_iter().map(|p| p.endpoint).collect())
    }

    /// Insert or refresh a peer
    pub fn add_peer(&self, endpoint: &Endpoint) -> Result<()> {
        let record = StoredPeer {
            endpoint: endpoint.clone(),
            last_seen: current_timestamp()?,
        };
        self.tree
            .insert(endpoint.to_string().as_bytes(), serialize(&record)?)?;
        self.tree.flush()?;
        debug!("Stored peer {endpoint}");
        Ok(())
    }

    pub fn remove_peer(&self, endpoint: &Endpoint) -> Result<bool> {
        let removed = self.tree.remove(endpoint.to_string().as_bytes())?.is_some();
        self.tree.flush()?;
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_read_remove() {
        let dir = TempDir::new().unwrap();
        let db = PeerDatabase::open(&dir.path().join("peers")).unwrap();
        assert!(db.is_empty());

        db.add_peer(&Endpoint::new("10.0.0.2", 6800)).unwrap();
        db.add_peer(&Endpoint::new("10.0.0.1", 6800)).unwrap();
        // Refreshing does not duplicate
        db.add_peer(&Endpoint::new("10.0.0.1", 6800)).unwrap();
        assert_eq!(db.len(), 2);

        let endpoints = db.endpoints().unwrap();
        assert!(endpoints.contains(&Endpoint::new("10.0.0.1", 6800)));
        assert!(endpoints.contains(&Endpoint::new("10.0.0.2", 6800)));

        assert!(db.remove_peer(&Endpoint::new("10.0.0.1", 6800)).unwrap());
        assert!(!db.remove_peer(&Endpoint::new("10.0.0.1", 6800)).unwrap());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_peers_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peers");
        {
            let db = PeerDatabase::open(&path).unwrap();
            db.add_peer(&Endpoint::new("seed.example.org", 6789)).unwrap();
        }
        let db = PeerDatabase::open(&path).unwrap();
        let peers = db.read_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].endpoint, Endpoint::new("seed.example.org", 6789));
        assert!(peers[0].last_seen > 0);

        db.clear().unwrap();
        assert!(db.is_empty());
    }
}
