//! The authoritative set of connected peers
//!
//! The pool admits authenticated links, keeps the peer count near its target
//! through periodic maintenance, answers and consumes peer-exchange messages
//! and fans broadcasts out to every peer.

use crate::error::{NetworkError, Result};
use crate::network::address_book::{AddressBook, BUCKET_SIZE};
use crate::network::connection::{Connector, Link};
use crate::network::events::{NetworkEvent, PeerEvent, PeerId};
use crate::network::node::{Endpoint, PeerIdentity};
use crate::network::peer::{Peer, PeerConfig, PeerState};
use crate::protocol::{MessageType, RequestPeers, ReturnPeers};
use crate::storage::PeerDatabase;
use crate::wire::Message;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub target_peer_count: usize,
    /// Tried in order when the pool is empty; the first is preferred
    pub bootnodes: Vec<Endpoint>,
    /// Our own advertised endpoint, never dialed
    pub self_endpoint: Option<Endpoint>,
    pub peer: PeerConfig,
    /// How long maintenance waits for `RequestPeers` writes
    pub request_timeout: Duration,
    /// How long `remove_peer` waits for the goodbye message
    pub goodbye_timeout: Duration,
    pub address_book_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_peer_count: 8,
            bootnodes: Vec::new(),
            self_endpoint: None,
            peer: PeerConfig::default(),
            request_timeout: Duration::from_secs(3),
            goodbye_timeout: Duration::from_millis(200),
            address_book_capacity: BUCKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPeerOutcome {
    Added(PeerId),
    /// A peer with the same key or endpoint was already present
    AlreadyConnected(PeerId),
    /// The link resumed a reconnecting peer with the same key
    Resumed(PeerId),
}

impl AddPeerOutcome {
    pub fn peer(&self) -> PeerId {
        match self {
            AddPeerOutcome::Added(id)
            | AddPeerOutcome::AlreadyConnected(id)
            | AddPeerOutcome::Resumed(id) => *id,
        }
    }
}

/// What a maintenance cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub bootstrapped: Option<Endpoint>,
    pub dropped_bootnode: bool,
    /// Number of peers asked for with `RequestPeers`, 0 if none
    pub requested_peers: usize,
    /// Peers removed to shrink the pool, earliest first
    pub removed: Vec<PeerId>,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// Another cycle or a peer exchange was running
    Skipped,
    Completed(MaintenanceReport),
}

/// Holds a busy flag for as long as it lives
struct BusyFlag<'a>(&'a AtomicBool);

impl<'a> BusyFlag<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<BusyFlag<'a>> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyFlag(flag))
    }
}

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PeerPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    local_public_key: Vec<u8>,
    /// Insertion order: the front holds the earliest-added peers
    peers: RwLock<Vec<Peer>>,
    next_id: AtomicU64,
    boot_node: RwLock<Option<Endpoint>>,
    undergoing_maintenance: AtomicBool,
    receiving_peers: AtomicBool,
    peer_events_tx: Sender<PeerEvent>,
    peer_events_rx: Receiver<PeerEvent>,
    subscribers: Mutex<Vec<Sender<NetworkEvent>>>,
    address_book: AddressBook,
    peer_db: Option<PeerDatabase>,
}

impl PeerPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>, local_public_key: Vec<u8>) -> Self {
        let (peer_events_tx, peer_events_rx) = unbounded();
        let boot_node = config.bootnodes.first().cloned();
        let address_book = AddressBook::new(config.address_book_capacity);
        Self {
            config,
            connector,
            local_public_key,
            peers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            boot_node: RwLock::new(boot_node),
            undergoing_maintenance: AtomicBool::new(false),
            receiving_peers: AtomicBool::new(false),
            peer_events_tx,
            peer_events_rx,
            subscribers: Mutex::new(Vec::new()),
            address_book,
            peer_db: None,
        }
    }

    /// Persist peers as they join and leave
    pub fn with_peer_database(mut self, db: PeerDatabase) -> Self {
        self.peer_db = Some(db);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    /// The bootnode currently preferred for bootstrapping
    pub fn boot_node(&self) -> Option<Endpoint> {
        self.boot_node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_undergoing_maintenance(&self) -> bool {
        self.undergoing_maintenance.load(Ordering::Acquire)
    }

    pub fn is_receiving_peers(&self) -> bool {
        self.receiving_peers.load(Ordering::Acquire)
    }

    /// New receiver of application events
    pub fn subscribe(&self) -> Receiver<NetworkEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, event: NetworkEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn read_peers(&self) -> RwLockReadGuard<'_, Vec<Peer>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_peers(&self) -> RwLockWriteGuard<'_, Vec<Peer>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the peer set in insertion order
    pub fn peers(&self) -> Vec<Peer> {
        self.read_peers().clone()
    }

    pub fn len(&self) -> usize {
        self.read_peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_peers().is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.read_peers().iter().map(|p| p.endpoint().clone()).collect()
    }

    pub fn get_peer(&self, id: PeerId) -> Option<Peer> {
        self.read_peers().iter().find(|p| p.id() == id).cloned()
    }

    /// Look a peer up by endpoint, public key or both; every given key must match
    pub fn find_peer(&self, endpoint: Option<&Endpoint>, public_key: Option<&[u8]>) -> Option<Peer> {
        if endpoint.is_none() && public_key.is_none() {
            return None;
        }
        self.read_peers()
            .iter()
            .find(|p| {
                endpoint.map_or(true, |e| p.endpoint() == e)
                    && public_key.map_or(true, |k| p.public_key() == k)
            })
            .cloned()
    }

    fn is_self(&self, endpoint: &Endpoint) -> bool {
        self.config.self_endpoint.as_ref() == Some(endpoint)
    }

    /// Admission check for an inbound handshake.
    ///
    /// A known key is only a duplicate while its peer is connected; otherwise
    /// the link will resume that peer.
    pub fn authenticate(&self, identity: &PeerIdentity, endpoint: &Endpoint) -> Result<()> {
        if identity.public_key == self.local_public_key {
            return Err(NetworkError::Handshake("connection to ourselves".to_string()));
        }
        if let Some(existing) = self.find_peer(None, Some(&identity.public_key)) {
            if existing.is_available() {
                return Err(NetworkError::DuplicatePeer(format!(
                    "key {} already connected as {}",
                    identity.short_id(),
                    existing.endpoint()
                )));
            }
            return Ok(());
        }
        if self.find_peer(Some(endpoint), None).is_some() {
            return Err(NetworkError::DuplicatePeer(format!("{endpoint} already connected")));
        }
        Ok(())
    }

    /// Start a peer on an authenticated link.
    ///
    /// A link from a node whose peer is reconnecting resumes that peer. Any
    /// other link to a node we already hold is closed and reported as
    /// `AlreadyConnected`.
    pub fn add_peer(&self, link: Link) -> Result<AddPeerOutcome> {
        if link.identity.public_key == self.local_public_key {
            let _ = link.stream.shutdown(Shutdown::Both);
            return Err(NetworkError::Handshake("refusing to add ourselves".to_string()));
        }

        let peer = {
            let mut peers = self.write_peers();
            let same_key = peers
                .iter()
                .find(|p| p.public_key() == link.identity.public_key.as_slice());
            if let Some(existing) = same_key {
                if existing.state() == PeerState::Reconnecting {
                    if existing.adopt(link.stream)? {
                        return Ok(AddPeerOutcome::Resumed(existing.id()));
                    }
                } else {
                    let _ = link.stream.shutdown(Shutdown::Both);
                }
                debug!("{} already in pool as {existing}", link.endpoint);
                return Ok(AddPeerOutcome::AlreadyConnected(existing.id()));
            }
            if let Some(existing) = peers.iter().find(|p| p.endpoint() == &link.endpoint) {
                debug!("{} already in pool as {existing}", link.endpoint);
                let _ = link.stream.shutdown(Shutdown::Both);
                return Ok(AddPeerOutcome::AlreadyConnected(existing.id()));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let peer = Peer::start(
                id,
                link,
                Arc::clone(&self.connector),
                self.config.peer.clone(),
                self.peer_events_tx.clone(),
            )?;
            peers.push(peer.clone());
            peer
        };

        if let Some(db) = &self.peer_db {
            if let Err(e) = db.add_peer(peer.endpoint()) {
                warn!("Failed to persist peer {}: {e}", peer.endpoint());
            }
        }
        info!("Added peer {peer} ({} in pool)", self.len());
        self.notify(NetworkEvent::PeerConnected {
            peer: peer.id(),
            endpoint: peer.endpoint().clone(),
        });
        Ok(AddPeerOutcome::Added(peer.id()))
    }

    /// Dial an endpoint and add the resulting peer
    pub fn connect_and_add(&self, endpoint: &Endpoint) -> Result<AddPeerOutcome> {
        if let Some(existing) = self.find_peer(Some(endpoint), None) {
            return Ok(AddPeerOutcome::AlreadyConnected(existing.id()));
        }
        let link = self.connector.connect(endpoint)?;
        self.add_peer(link)
    }

    /// Say goodbye, disconnect and forget a peer
    pub fn remove_peer(&self, id: PeerId) -> bool {
        self.take_peer(id, true, true)
    }

    pub fn remove_peer_by_endpoint(&self, endpoint: &Endpoint) -> bool {
        match self.find_peer(Some(endpoint), None) {
            Some(peer) => self.remove_peer(peer.id()),
            None => false,
        }
    }

    /// Remove a peer from the set. `forget` also drops it from the peer database.
    fn take_peer(&self, id: PeerId, say_goodbye: bool, forget: bool) -> bool {
        let removed = {
            let mut peers = self.write_peers();
            peers
                .iter()
                .position(|p| p.id() == id)
                .map(|index| peers.remove(index))
        };
        let Some(peer) = removed else {
            return false;
        };

        if say_goodbye && peer.is_available() {
            peer.say_goodbye(self.config.goodbye_timeout);
        }
        peer.disconnect();
        if let Some(db) = self.peer_db.as_ref().filter(|_| forget) {
            if let Err(e) = db.remove_peer(peer.endpoint()) {
                warn!("Failed to forget peer {}: {e}", peer.endpoint());
            }
        }
        info!("Removed peer {peer} ({} in pool)", self.len());
        self.notify(NetworkEvent::PeerDisconnected {
            peer: peer.id(),
            endpoint: peer.endpoint().clone(),
        });
        true
    }

    /// Endpoints of up to `count` available peers, never `exclude`
    pub fn get_peers(&self, count: usize, exclude: Option<PeerId>) -> Vec<Endpoint> {
        self.read_peers()
            .iter()
            .filter(|p| Some(p.id()) != exclude && p.is_available())
            .take(count)
            .map(|p| p.endpoint().clone())
            .collect()
    }

    /// Queue `message` on every peer; false if there was nobody to send to
    pub fn broadcast(&self, message: &Message) -> bool {
        let peers = self.peers();
        if peers.is_empty() {
            return false;
        }
        for peer in &peers {
            if let Err(e) = peer.send(message.clone()) {
                warn!("Broadcast to {peer} failed: {e}");
            }
        }
        true
    }

    /// Broadcast and wait up to `timeout` for the writes; returns how many succeeded
    pub fn broadcast_and_wait(&self, message: &Message, timeout: Duration) -> usize {
        let (done_tx, done_rx) = unbounded();
        let mut pending = 0;
        for peer in self.peers() {
            let done_tx = done_tx.clone();
            let queued = peer.send_with_callback(
                message.clone(),
                Box::new(move |result| {
                    let _ = done_tx.send(result);
                }),
            );
            match queued {
                Ok(()) => pending += 1,
                Err(e) => warn!("Broadcast to {peer} failed: {e}"),
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + timeout;
        let mut delivered = 0;
        for _ in 0..pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => debug!("Broadcast write failed: {e}"),
                Err(_) => break,
            }
        }
        delivered
    }

    /// One pass of pool upkeep
    pub fn maintenance_cycle(&self) -> MaintenanceOutcome {
        if self.is_receiving_peers() {
            debug!("Skipping maintenance: receiving peers");
            return MaintenanceOutcome::Skipped;
        }
        let Some(busy) = BusyFlag::try_acquire(&self.undergoing_maintenance) else {
            debug!("Skipping maintenance: cycle already running");
            return MaintenanceOutcome::Skipped;
        };

        let mut report = MaintenanceReport::default();
        if self.is_empty() {
            report.bootstrapped = self.bootstrap();
        } else if self.len() > self.config.target_peer_count / 2 {
            report.dropped_bootnode = self.drop_boot_node();
        }

        let count = self.len();
        let target = self.config.target_peer_count;
        if count < target {
            let missing = target - count;
            // Replies must not be ignored as "during maintenance"
            drop(busy);
            report.requested_peers = missing;
            match RequestPeers::new(missing).to_message() {
                Ok(request) => {
                    let delivered = self.broadcast_and_wait(&request, self.config.request_timeout);
                    debug!("Requested {missing} peers from {delivered} peers");
                }
                Err(e) => warn!("Failed to encode peer request: {e}"),
            }
        } else if count > target {
            let excess = count - target;
            let oldest: Vec<PeerId> = self.peers().iter().take(excess).map(Peer::id).collect();
            for id in oldest {
                if self.remove_peer(id) {
                    report.removed.push(id);
                }
            }
            info!("Pool above target, removed {} peers", report.removed.len());
        }

        report.duplicates_removed = self.remove_duplicate_peers();
        MaintenanceOutcome::Completed(report)
    }

    /// Dial the preferred bootnode, then the other bootnodes in order, then
    /// the address book, stopping at the first success
    pub fn bootstrap(&self) -> Option<Endpoint> {
        let mut candidates: Vec<Endpoint> = Vec::new();
        let known = self.boot_node().into_iter();
        let fallbacks = self.config.bootnodes.iter().cloned();
        for endpoint in known.chain(fallbacks).chain(self.address_book.endpoints()) {
            if !candidates.contains(&endpoint) && !self.is_self(&endpoint) {
                candidates.push(endpoint);
            }
        }

        for endpoint in candidates {
            match self.connect_and_add(&endpoint) {
                Ok(_) => {
                    if self.config.bootnodes.contains(&endpoint) {
                        *self.boot_node.write().unwrap_or_else(PoisonError::into_inner) =
                            Some(endpoint.clone());
                    }
                    info!("Bootstrapped from {endpoint}");
                    return Some(endpoint);
                }
                Err(e) => {
                    warn!("Bootstrap peer {endpoint} unavailable: {e}");
                    if !self.config.bootnodes.contains(&endpoint) {
                        self.forget_address(&endpoint);
                    }
                }
            }
        }
        warn!("No bootstrap peer reachable");
        None
    }

    fn forget_address(&self, endpoint: &Endpoint) {
        if self.address_book.remove(endpoint) {
            debug!("Dropped {endpoint} from the address book");
        }
    }

    fn drop_boot_node(&self) -> bool {
        let Some(boot_node) = self.boot_node() else {
            return false;
        };
        match self.find_peer(Some(&boot_node), None) {
            Some(peer) => {
                info!("Enough peers, releasing bootnode {boot_node}");
                self.remove_peer(peer.id())
            }
            None => false,
        }
    }

    /// Remove later copies of peers sharing an endpoint or public key
    pub fn remove_duplicate_peers(&self) -> usize {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut duplicates = Vec::new();
        for peer in self.peers() {
            let key = peer.public_key().to_vec();
            if endpoints.contains(peer.endpoint()) || keys.contains(&key) {
                duplicates.push(peer.id());
            } else {
                endpoints.push(peer.endpoint().clone());
                keys.push(key);
            }
        }

        let mut removed = 0;
        for id in duplicates {
            if self.remove_peer(id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {removed} duplicate peers");
        }
        removed
    }

    /// Dial advertised endpoints we do not know yet; returns how many were added
    pub fn receive_peers(&self, endpoints: Vec<Endpoint>) -> usize {
        if self.is_undergoing_maintenance() {
            debug!("Ignoring advertised peers during maintenance");
            return 0;
        }
        let Some(_receiving) = BusyFlag::try_acquire(&self.receiving_peers) else {
            debug!("Ignoring advertised peers: already receiving");
            return 0;
        };

        let mut added = 0;
        for endpoint in endpoints {
            if self.is_self(&endpoint) || self.find_peer(Some(&endpoint), None).is_some() {
                continue;
            }
            if let Err(e) = self.address_book.add(endpoint.clone()) {
                trace!("Not recording {endpoint}: {e}");
            }
            match self.connect_and_add(&endpoint) {
                Ok(AddPeerOutcome::Added(_)) => added += 1,
                Ok(_) => {}
                Err(e) => debug!("Advertised peer {endpoint} unavailable: {e}"),
            }
        }
        added
    }

    /// Handle one event raised by a peer
    pub fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer, message } => self.handle_message(peer, message),
            PeerEvent::Reconnected { peer } => debug!("Peer #{peer} reconnected"),
            PeerEvent::Unreachable { peer, cause } => {
                debug!("Peer #{peer} unreachable: {cause}");
                if let Some(lost) = self.get_peer(peer) {
                    self.forget_address(lost.endpoint());
                }
                self.take_peer(peer, false, true);
            }
        }
    }

    fn handle_message(self: &Arc<Self>, id: PeerId, message: Message) {
        let Some(peer) = self.get_peer(id) else {
            trace!("Dropping message from removed peer #{id}");
            return;
        };

        match MessageType::from_tag(message.msg_type) {
            Some(MessageType::RequestPeers) => {
                let reply = RequestPeers::from_message(&message).and_then(|request| {
                    ReturnPeers::new(&self.get_peers(request.num_peers as usize, Some(id)))
                        .to_message()
                });
                match reply {
                    Ok(reply) => {
                        if let Err(e) = peer.send(reply) {
                            debug!("Could not answer peer request from {peer}: {e}");
                        }
                    }
                    Err(e) => warn!("Bad peer request from {peer}: {e}"),
                }
            }
            Some(MessageType::ReturnPeers) => match ReturnPeers::from_message(&message) {
                Ok(returned) => {
                    if self.is_undergoing_maintenance() {
                        debug!("Ignoring peers from {peer} during maintenance");
                        return;
                    }
                    let endpoints = returned.endpoints();
                    debug!("{peer} advertised {} peers", endpoints.len());
                    let pool = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name("peerwireExchange".to_string())
                        .spawn(move || {
                            pool.receive_peers(endpoints);
                        });
                    if let Err(e) = spawned {
                        warn!("Failed to spawn peer exchange thread: {e}");
                    }
                }
                Err(e) => warn!("Bad peer list from {peer}: {e}"),
            },
            Some(MessageType::Disconnect) => {
                info!("{peer} is leaving");
                self.take_peer(id, false, true);
            }
            Some(MessageType::Handshake) => warn!("Unexpected handshake from {peer}"),
            _ => self.notify(NetworkEvent::MessageReceived {
                peer: id,
                endpoint: peer.endpoint().clone(),
                message,
            }),
        }
    }

    /// Handle peer events for up to `timeout`; returns how many were handled
    pub fn process_events(self: &Arc<Self>, timeout: Duration) -> usize {
        let first = match self.peer_events_rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
        };
        self.handle_peer_event(first);
        let mut handled = 1;
        while let Ok(event) = self.peer_events_rx.try_recv() {
            self.handle_peer_event(event);
            handled += 1;
        }
        handled
    }

    /// Event loop for a dedicated thread
    pub fn run_events(self: &Arc<Self>, exit: &AtomicBool) {
        while !exit.load(Ordering::Relaxed) {
            self.process_events(Duration::from_millis(100));
        }
        debug!("Pool event loop stopped");
    }

    /// Say goodbye to and disconnect every peer, keeping them in the peer
    /// database for the next start
    pub fn shutdown(&self) {
        let ids: Vec<PeerId> = self.read_peers().iter().map(Peer::id).collect();
        for id in ids {
            self.take_peer(id, true, false);
        }
    }
}
