use crate::error::{NetworkError, Result};
use crate::network::node::Endpoint;
use std::sync::{PoisonError, RwLock};

/// Default number of addresses a book will hold
pub const BUCKET_SIZE: usize = 20;

/// Bounded store of endpoints learned through peer exchange.
///
/// Used as a last resort when bootstrapping. Keeps insertion order so the
/// oldest entries are tried first.
pub struct AddressBook {
    capacity: usize,
    entries: RwLock<Vec<Endpoint>>,
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new(BUCKET_SIZE)
    }
}

impl AddressBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store an endpoint; fails with `DuplicateKey` or `StoreFull`
    pub fn add(&self, endpoint: Endpoint) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains(&endpoint) {
            return Err(NetworkError::DuplicateKey(endpoint.to_string()));
        }
        if entries.len() >= self.capacity {
            return Err(NetworkError::StoreFull(format!(
                "address book holds {} entries",
                self.capacity
            )));
        }
        entries.push(endpoint);
        Ok(())
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.read().contains(endpoint)
    }

    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e != endpoint);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot in insertion order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Endpoint>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let book = AddressBook::default();
        book.add(Endpoint::new("10.0.0.1", 6800)).unwrap();
        book.add(Endpoint::new("10.0.0.2", 6800)).unwrap();

        assert_eq!(book.len(), 2);
        assert!(book.contains(&Endpoint::new("10.0.0.1", 6800)));
        assert_eq!(book.endpoints()[1], Endpoint::new("10.0.0.2", 6800));
    }

    #[test]
    fn test_duplicate_rejected() {
        let book = AddressBook::default();
        book.add(Endpoint::new("10.0.0.1", 6800)).unwrap();
        assert!(matches!(
            book.add(Endpoint::new("10.0.0.1", 6800)),
            Err(NetworkError::DuplicateKey(_))
        ));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_full_book_rejects() {
        let book = AddressBook::new(2);
        book.add(Endpoint::new("10.0.0.1", 1)).unwrap();
        book.add(Endpoint::new("10.0.0.1", 2)).unwrap();
        assert!(matches!(
            book.add(Endpoint::new("10.0.0.1", 3)),
            Err(NetworkError::StoreFull(_))
        ));

        assert!(book.remove(&Endpoint::new("10.0.0.1", 1)));
        assert!(!book.remove(&Endpoint::new("10.0.0.1", 1)));
        book.add(Endpoint::new("10.0.0.1", 3)).unwrap();
    }
}
