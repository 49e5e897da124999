//! The running node: listener, pool event loop, job dispatch and the
//! maintenance timer, each on its own thread

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::identity::NodeKey;
use crate::network::connection::{Dialer, Direction, HandshakeConnector, Link, Listener};
use crate::network::events::{NetworkEvent, PeerId};
use crate::network::handshake::Handshaker;
use crate::network::node::{Endpoint, PeerIdentity};
use crate::network::pool::{AddPeerOutcome, PeerPool};
use crate::protocol::MessageType;
use crate::storage::PeerDatabase;
use crate::wire::Message;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a job's message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    Broadcast,
    Peer(PeerId),
}

/// An outbound message queued by the application
#[derive(Debug, Clone)]
pub struct NetworkJob {
    pub message: Message,
    pub target: JobTarget,
}

impl NetworkJob {
    pub fn broadcast(message: Message) -> Self {
        Self {
            message,
            target: JobTarget::Broadcast,
        }
    }

    pub fn to_peer(peer: PeerId, message: Message) -> Self {
        Self {
            message,
            target: JobTarget::Peer(peer),
        }
    }
}

pub struct NetworkServer {
    pool: Arc<PeerPool>,
    local_addr: SocketAddr,
    exit: Arc<AtomicBool>,
    jobs: Sender<NetworkJob>,
    stop_maintenance: Mutex<Option<Sender<()>>>,
    events: Receiver<NetworkEvent>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkServer {
    /// Bind the listener and start every node thread.
    ///
    /// Only binding, configuration and thread creation can fail here; peers
    /// that cannot be reached are logged and retried by maintenance.
    pub fn start(config: &NetworkConfig, key: Arc<NodeKey>) -> Result<NetworkServer> {
        config.validate()?;
        let listener = Listener::bind(&config.listen_addr())?;
        let local_addr = listener.local_addr()?;
        info!("Node {} listening on {local_addr}", key.short_id());

        let handshaker = Handshaker::new(Arc::clone(&key), local_addr.port());
        let connector =
            HandshakeConnector::new(Dialer::new(config.dial_timeout()), handshaker.clone())
                .with_handshake_timeout(config.handshake_timeout());
        let mut pool = PeerPool::new(
            config.pool_config(local_addr.port())?,
            Arc::new(connector),
            key.public_key().to_vec(),
        );

        let mut stored_peers = Vec::new();
        if config.persist_peers {
            match PeerDatabase::open(&config.peer_db_path()) {
                Ok(db) => {
                    match db.endpoints() {
                        Ok(endpoints) => stored_peers = endpoints,
                        Err(e) => warn!("Failed to read stored peers: {e}"),
                    }
                    pool = pool.with_peer_database(db);
                }
                Err(e) => warn!("Peer database unavailable, peers will not persist: {e}"),
            }
        }

        let pool = Arc::new(pool);
        let events = pool.subscribe();
        let exit = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        let accept_pool = Arc::clone(&pool);
        let handshake_timeout = config.handshake_timeout();
        handles.push(listener.spawn(Arc::clone(&exit), move |stream, addr| {
            let pool = Arc::clone(&accept_pool);
            let handshaker = handshaker.clone();
            let spawned = thread::Builder::new()
                .name("peerwireInbound".to_string())
                .spawn(move || {
                    if let Err(e) =
                        accept_inbound(&pool, &handshaker, stream, addr, handshake_timeout)
                    {
                        debug!("Rejected connection from {addr}: {e}");
                    }
                });
            if let Err(e) = spawned {
                error!("Failed to spawn inbound handshake thread: {e}");
            }
        })?);

        let event_pool = Arc::clone(&pool);
        let event_exit = Arc::clone(&exit);
        handles.push(spawn_named("peerwireEvents", move || {
            event_pool.run_events(&event_exit)
        })?);

        let (jobs, job_rx) = unbounded();
        let job_pool = Arc::clone(&pool);
        let job_exit = Arc::clone(&exit);
        handles.push(spawn_named("peerwireJobs", move || {
            run_jobs(&job_pool, &job_rx, &job_exit)
        })?);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let maintenance_pool = Arc::clone(&pool);
        let initial_delay = config.initial_maintenance_delay();
        let period = config.maintenance_period();
        handles.push(spawn_named("peerwireMaint", move || {
            run_maintenance(&maintenance_pool, &stop_rx, initial_delay, period)
        })?);

        let setup_pool = Arc::clone(&pool);
        let mut initial_peers = config.static_peer_endpoints()?;
        initial_peers.extend(stored_peers);
        handles.push(spawn_named("peerwireSetup", move || {
            dial_initial_peers(&setup_pool, initial_peers)
        })?);

        Ok(NetworkServer {
            pool,
            local_addr,
            exit,
            jobs,
            stop_maintenance: Mutex::new(Some(stop_tx)),
            events,
            handles: Mutex::new(handles),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    pub fn peer_count(&self) -> usize {
        self.pool.len()
    }

    /// Application events for the node's owner
    pub fn events(&self) -> &Receiver<NetworkEvent> {
        &self.events
    }

    /// An additional, independent event receiver
    pub fn subscribe(&self) -> Receiver<NetworkEvent> {
        self.pool.subscribe()
    }

    pub fn enqueue_job(&self, job: NetworkJob) -> Result<()> {
        if self.exit.load(Ordering::Relaxed) {
            return Err(NetworkError::Shutdown);
        }
        self.jobs.send(job).map_err(|_| NetworkError::Shutdown)
    }

    pub fn send_to(&self, peer: PeerId, message: Message) -> Result<()> {
        self.enqueue_job(NetworkJob::to_peer(peer, message))
    }

    pub fn broadcast(&self, message: Message) -> Result<()> {
        self.enqueue_job(NetworkJob::broadcast(message))
    }

    pub fn broadcast_block(&self, block: Vec<u8>) -> Result<()> {
        self.broadcast(MessageType::Block.message(block))
    }

    pub fn broadcast_transaction(&self, transaction: Vec<u8>) -> Result<()> {
        self.broadcast(MessageType::Transaction.message(transaction))
    }

    pub fn broadcast_announcement(&self, announcement: Vec<u8>) -> Result<()> {
        self.broadcast(MessageType::Announcement.message(announcement))
    }

    /// Stop every thread and disconnect all peers. Idempotent.
    pub fn stop(&self) {
        if self.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping node on {}", self.local_addr);
        self.stop_maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pool.shutdown();

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("A network thread panicked");
            }
        }
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| NetworkError::Io(format!("Failed to spawn {name} thread: {e}")))
}

/// Peers are known by the remote address and the port they listen on
fn inbound_endpoint(addr: &SocketAddr, identity: &PeerIdentity) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), identity.listening_port)
}

fn accept_inbound(
    pool: &PeerPool,
    handshaker: &Handshaker,
    mut stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let identity = handshaker.respond(&mut stream, |identity| {
        pool.authenticate(identity, &inbound_endpoint(&addr, identity))
    })?;
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;

    let link = Link {
        stream,
        endpoint: inbound_endpoint(&addr, &identity),
        identity,
        direction: Direction::Inbound,
    };
    match pool.add_peer(link)? {
        AddPeerOutcome::Added(_) => {}
        AddPeerOutcome::Resumed(id) => debug!("Inbound connection from {addr} resumed peer #{id}"),
        AddPeerOutcome::AlreadyConnected(id) => {
            debug!("Inbound connection from {addr} duplicates peer #{id}")
        }
    }
    Ok(())
}

fn run_jobs(pool: &PeerPool, jobs: &Receiver<NetworkJob>, exit: &AtomicBool) {
    while !exit.load(Ordering::Relaxed) {
        match jobs.recv_timeout(JOB_POLL_INTERVAL) {
            Ok(job) => dispatch(pool, job),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Job dispatch stopped");
}

fn dispatch(pool: &PeerPool, job: NetworkJob) {
    match job.target {
        JobTarget::Broadcast => {
            if !pool.broadcast(&job.message) {
                debug!("No peers to broadcast message type {}", job.message.msg_type);
            }
        }
        JobTarget::Peer(id) => match pool.get_peer(id) {
            Some(peer) => {
                if let Err(e) = peer.send(job.message) {
                    warn!("Send to {peer} failed: {e}");
                }
            }
            None => debug!("Dropping job for unknown peer #{id}"),
        },
    }
}

fn run_maintenance(pool: &PeerPool, stop: &Receiver<()>, initial_delay: Duration, period: Duration) {
    let mut wait = initial_delay;
    loop {
        match stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                let outcome = pool.maintenance_cycle();
                debug!("Maintenance: {outcome:?}");
            }
            _ => break,
        }
        wait = period;
    }
    debug!("Maintenance timer stopped");
}

fn dial_initial_peers(pool: &PeerPool, endpoints: Vec<Endpoint>) {
    for endpoint in endpoints {
        match pool.connect_and_add(&endpoint) {
            Ok(AddPeerOutcome::Added(id)) => debug!("Connected to configured peer {endpoint} as #{id}"),
            Ok(_) => {}
            Err(e) => warn!("Could not reach {endpoint}: {e}"),
        }
    }
}
