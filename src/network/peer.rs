//! A single remote node: one reader, one writer and a supervisor thread
//!
//! The supervisor consumes the reader and writer events, forwards inbound
//! messages to the pool and drives reconnection when the stream drops.

use crate::error::{NetworkError, Result};
use crate::network::connection::{Connector, Direction, Link};
use crate::network::events::{PeerEvent, PeerId};
use crate::network::node::{Endpoint, PeerIdentity};
use crate::protocol::{disconnect_message, MessageType};
use crate::wire::{
    Message, MessageReader, MessageWriter, ReaderEvent, SendCallback, WriterEvent,
    DEFAULT_CHUNK_SIZE,
};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use rand::Rng;
use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Reconnect attempts before the peer is declared unreachable
    pub reconnect_attempts: u32,
    /// Delay before the first attempt; doubles after each failure
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub chunk_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The live socket plus its writer; the reader owns a clone of the stream
struct Session {
    stream: TcpStream,
    writer: MessageWriter,
}

type SessionEvents = (Receiver<ReaderEvent>, Receiver<WriterEvent>);

impl Session {
    fn open(stream: TcpStream, label: &str, chunk_size: usize) -> Result<(Session, SessionEvents)> {
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let (reader_tx, reader_rx) = unbounded();
        MessageReader::new(read_half).spawn(format!("{label}Read"), reader_tx)?;

        let (writer_tx, writer_rx) = unbounded();
        let writer =
            match MessageWriter::spawn(write_half, format!("{label}Write"), chunk_size, writer_tx) {
                Ok(writer) => writer,
                Err(e) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(e);
                }
            };

        Ok((Session { stream, writer }, (reader_rx, writer_rx)))
    }

    fn close(self) {
        // Unblocks the reader; dropping the writer closes its queue
        let _ = self.stream.shutdown(Shutdown::Both);
        drop(self.writer);
    }
}

enum Reconnect {
    Restored(SessionEvents),
    Cancelled,
    Exhausted(NetworkError),
}

struct PeerInner {
    id: PeerId,
    identity: PeerIdentity,
    endpoint: Endpoint,
    direction: Direction,
    config: PeerConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PeerState>,
    session: Mutex<Option<Session>>,
    events: RwLock<Option<Sender<PeerEvent>>>,
    cancel: Mutex<Option<Sender<()>>>,
    /// Sessions opened by `adopt` for the supervisor to pick up
    handoff: Sender<SessionEvents>,
    remote_closing: AtomicBool,
    packets_received: AtomicU64,
    failed_protocol: AtomicU64,
}

/// Cheap, clonable handle to a connected peer
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Dial `endpoint` and start a peer on the resulting link
    pub fn connect(
        id: PeerId,
        endpoint: &Endpoint,
        connector: Arc<dyn Connector>,
        config: PeerConfig,
        events: Sender<PeerEvent>,
    ) -> Result<Peer> {
        debug!("Connecting to {endpoint}");
        let link = connector.connect(endpoint)?;
        Self::start(id, link, connector, config, events)
    }

    /// Wrap an authenticated link and start its reader, writer and supervisor
    pub fn start(
        id: PeerId,
        link: Link,
        connector: Arc<dyn Connector>,
        config: PeerConfig,
        events: Sender<PeerEvent>,
    ) -> Result<Peer> {
        let label = format!("peer{id}");
        let (session, (reader_rx, writer_rx)) =
            Session::open(link.stream, &label, config.chunk_size)?;
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let (handoff, handoff_rx) = bounded(1);

        let inner = Arc::new(PeerInner {
            id,
            identity: link.identity,
            endpoint: link.endpoint,
            direction: link.direction,
            config,
            connector,
            state: Mutex::new(PeerState::Connected),
            session: Mutex::new(Some(session)),
            events: RwLock::new(Some(events)),
            cancel: Mutex::new(Some(cancel_tx)),
            handoff,
            remote_closing: AtomicBool::new(false),
            packets_received: AtomicU64::new(0),
            failed_protocol: AtomicU64::new(0),
        });

        let supervisor = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name(format!("{label}Sup"))
            .spawn(move || supervisor.supervise(reader_rx, writer_rx, cancel_rx, handoff_rx));
        if let Err(e) = spawned {
            inner.teardown();
            return Err(NetworkError::Io(format!("Failed to spawn peer supervisor: {e}")));
        }

        let peer = Peer { inner };
        info!("Peer {peer} connected ({:?})", peer.direction());
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    pub fn public_key(&self) -> &[u8] {
        &self.inner.identity.public_key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> PeerState {
        self.inner.state()
    }

    pub fn is_available(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn packets_received_count(&self) -> u64 {
        self.inner.packets_received.load(Ordering::Relaxed)
    }

    pub fn failed_protocol_count(&self) -> u64 {
        self.inner.failed_protocol.load(Ordering::Relaxed)
    }

    /// Queue a message; returns immediately.
    ///
    /// Fails only if the peer is not connected. Write failures are reported
    /// asynchronously through the reconnect machinery.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner.with_writer(|writer| writer.enqueue(message))
    }

    /// Like [`Peer::send`], with `callback` told the outcome of the write
    pub fn send_with_callback(&self, message: Message, callback: SendCallback) -> Result<()> {
        self.inner
            .with_writer(|writer| writer.enqueue_with_callback(message, callback))
    }

    pub fn enqueue_block(&self, block: Vec<u8>, callback: SendCallback) -> Result<()> {
        self.send_with_callback(MessageType::Block.message(block), callback)
    }

    pub fn enqueue_transaction(&self, transaction: Vec<u8>, callback: SendCallback) -> Result<()> {
        self.send_with_callback(MessageType::Transaction.message(transaction), callback)
    }

    pub fn enqueue_announcement(&self, announcement: Vec<u8>, callback: SendCallback) -> Result<()> {
        self.send_with_callback(MessageType::Announcement.message(announcement), callback)
    }

    /// Send and wait up to `timeout` for the write to complete
    pub fn send_and_wait(&self, message: Message, timeout: Duration) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.send_with_callback(
            message,
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        )?;
        match done_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(format!(
                "write to {} not confirmed within {timeout:?}",
                self.endpoint()
            ))),
        }
    }

    /// Best-effort notice to the remote that we are leaving
    pub fn say_goodbye(&self, timeout: Duration) {
        if let Err(e) = self.send_and_wait(disconnect_message(), timeout) {
            debug!("Goodbye to {self} not delivered: {e}");
        }
    }

    /// Resume a reconnecting peer on a stream the same node opened to us.
    ///
    /// Returns false, closing `stream`, unless the peer is `Reconnecting`.
    pub fn adopt(&self, stream: TcpStream) -> Result<bool> {
        let mut state = lock(&self.inner.state);
        match self.inner.install(&mut state, stream)? {
            Some(events) => {
                // Sent under the state lock so a racing dial finds it
                let _ = self.inner.handoff.try_send(events);
                info!("Peer {self} resumed on an inbound connection");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear the peer down. Idempotent; returns false if already disconnected.
    pub fn disconnect(&self) -> bool {
        let was_live = self.inner.teardown();
        if was_live {
            info!("Peer {self} disconnected");
        }
        was_live
    }
}

#[cfg(test)]
impl Peer {
    /// Shut the live socket down without touching the peer's state
    pub(crate) fn sever(&self, how: Shutdown) {
        if let Some(session) = lock(&self.inner.session).as_ref() {
            let _ = session.stream.shutdown(how);
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} [{}]", self.inner.id, self.inner.endpoint, self.inner.identity.short_id())
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerInner {
    fn state(&self) -> PeerState {
        *lock(&self.state)
    }

    fn emit(&self, event: PeerEvent) {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(events) = events.as_ref() {
            let _ = events.send(event);
        }
    }

    fn with_writer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&MessageWriter) -> Result<()>,
    {
        if self.state() != PeerState::Connected {
            return Err(NetworkError::NotConnected(self.endpoint.to_string()));
        }
        match lock(&self.session).as_ref() {
            Some(session) => f(&session.writer),
            None => Err(NetworkError::NotConnected(self.endpoint.to_string())),
        }
    }

    fn teardown(&self) -> bool {
        let was_live = {
            let mut state = lock(&self.state);
            let was_live = *state != PeerState::Disconnected;
            *state = PeerState::Disconnected;
            was_live
        };
        // Dropping the sender wakes a reconnect wait
        lock(&self.cancel).take();
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        was_live
    }

    fn supervise(
        &self,
        mut reader_rx: Receiver<ReaderEvent>,
        mut writer_rx: Receiver<WriterEvent>,
        cancel_rx: Receiver<()>,
        handoff_rx: Receiver<SessionEvents>,
    ) {
        loop {
            let cause = self.pump(&reader_rx, &writer_rx);
            if matches!(cause, NetworkError::Protocol(_)) {
                self.failed_protocol.fetch_add(1, Ordering::Relaxed);
            }

            if self.state() == PeerState::Disconnected {
                break;
            }
            if self.remote_closing.load(Ordering::Relaxed) {
                debug!("Peer #{} at {} said goodbye", self.id, self.endpoint);
                self.emit(PeerEvent::Unreachable { peer: self.id, cause });
                self.teardown();
                break;
            }

            warn!("Connection to {} lost: {cause}", self.endpoint);
            match self.reconnect(&cancel_rx, &handoff_rx) {
                Reconnect::Restored((reader, writer)) => {
                    reader_rx = reader;
                    writer_rx = writer;
                    info!("Reconnected to {}", self.endpoint);
                    self.emit(PeerEvent::Reconnected { peer: self.id });
                }
                Reconnect::Cancelled => break,
                Reconnect::Exhausted(cause) => {
                    warn!("Peer {} unreachable: {cause}", self.endpoint);
                    self.emit(PeerEvent::Unreachable { peer: self.id, cause });
                    self.teardown();
                    break;
                }
            }
        }
        debug!("Supervisor for peer #{} exiting", self.id);
    }

    /// Forward inbound messages until the session ends; returns why it ended
    fn pump(
        &self,
        reader_rx: &Receiver<ReaderEvent>,
        writer_rx: &Receiver<WriterEvent>,
    ) -> NetworkError {
        loop {
            select! {
                recv(reader_rx) -> event => match event {
                    Ok(ReaderEvent::Message(message)) => self.on_message(message),
                    Ok(ReaderEvent::Closed(cause)) => return cause,
                    Err(_) => return NetworkError::Io("reader stopped".to_string()),
                },
                recv(writer_rx) -> event => match event {
                    Ok(WriterEvent::Failed(cause)) => return cause,
                    Err(_) => return NetworkError::Io("writer stopped".to_string()),
                },
            }
        }
    }

    fn on_message(&self, message: Message) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        if message.msg_type == MessageType::Disconnect.tag() {
            self.remote_closing.store(true, Ordering::Relaxed);
        }
        self.emit(PeerEvent::Message {
            peer: self.id,
            message,
        });
    }

    /// Outbound peers redial; inbound peers wait for the remote to come
    /// back and be adopted, one slot longer than the remote keeps trying
    fn reconnect(&self, cancel_rx: &Receiver<()>, handoff_rx: &Receiver<SessionEvents>) -> Reconnect {
        let stale = {
            let mut state = lock(&self.state);
            if *state == PeerState::Disconnected {
                return Reconnect::Cancelled;
            }
            *state = PeerState::Reconnecting;
            lock(&self.session).take()
        };
        if let Some(session) = stale {
            session.close();
        }

        let dials = self.direction == Direction::Outbound;
        let slots = if dials {
            self.config.reconnect_attempts
        } else {
            self.config.reconnect_attempts + 1
        };
        let mut delay = self.config.reconnect_delay;
        let mut last_error = NetworkError::NotConnected(self.endpoint.to_string());
        for attempt in 1..=slots {
            let wait = if dials { delay + jitter(delay) } else { delay + delay / 4 };
            select! {
                recv(cancel_rx) -> _ => return Reconnect::Cancelled,
                recv(handoff_rx) -> events => return match events {
                    Ok(events) => Reconnect::Restored(events),
                    Err(_) => Reconnect::Cancelled,
                },
                default(wait) => {}
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
            if !dials {
                continue;
            }

            info!("Reconnecting to {} (attempt {attempt}/{slots})", self.endpoint);
            match self.connector.connect(&self.endpoint) {
                Ok(link) if link.identity.public_key != self.identity.public_key => {
                    warn!("{} answered with a different key", self.endpoint);
                    last_error =
                        NetworkError::Handshake("public key changed on reconnect".to_string());
                }
                Ok(link) => {
                    let mut state = lock(&self.state);
                    match self.install(&mut state, link.stream) {
                        Ok(Some(events)) => return Reconnect::Restored(events),
                        // Torn down, or adopted an inbound stream meanwhile
                        Ok(None) => return handed_off(handoff_rx),
                        Err(e) => last_error = e,
                    }
                }
                Err(e) => {
                    debug!("Reconnect attempt {attempt} to {} failed: {e}", self.endpoint);
                    last_error = e;
                }
            }
        }

        {
            let mut state = lock(&self.state);
            if *state != PeerState::Reconnecting {
                drop(state);
                return handed_off(handoff_rx);
            }
            *state = PeerState::Disconnected;
        }
        Reconnect::Exhausted(last_error)
    }

    /// Open a session on `stream` if the peer is still waiting for one.
    /// The caller holds the state lock.
    fn install(&self, state: &mut PeerState, stream: TcpStream) -> Result<Option<SessionEvents>> {
        if *state != PeerState::Reconnecting {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(None);
        }
        let (session, events) =
            Session::open(stream, &format!("peer{}", self.id), self.config.chunk_size)?;
        *lock(&self.session) = Some(session);
        *state = PeerState::Connected;
        Ok(Some(events))
    }
}

/// The session `adopt` left behind, if the peer was not torn down instead
fn handed_off(handoff_rx: &Receiver<SessionEvents>) -> Reconnect {
    match handoff_rx.try_recv() {
        Ok(events) => Reconnect::Restored(events),
        Err(_) => Reconnect::Cancelled,
    }
}

/// Random extra wait of up to a quarter of `delay`
fn jitter(delay: Duration) -> Duration {
    let max = delay.as_millis() as u64 / 4;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::{read_frame, write_message, Frame};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(3);

    /// A connected pair of loopback sockets plus the listening port
    pub(crate) fn socket_pair() -> (TcpStream, TcpStream, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let local = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (remote, _) = listener.accept().unwrap();
        (local, remote, port)
    }

    pub(crate) fn identity(key: &[u8], port: u16) -> PeerIdentity {
        PeerIdentity {
            public_key: key.to_vec(),
            listening_port: port,
            protocol_version: 1,
        }
    }

    pub(crate) fn test_link(key: &[u8], host: &str, port: u16) -> (Link, TcpStream) {
        let (local, remote, _) = socket_pair();
        let link = Link {
            stream: local,
            identity: identity(key, port),
            endpoint: Endpoint::new(host, port),
            direction: Direction::Outbound,
        };
        (link, remote)
    }

    /// Connector that always fails and counts attempts
    #[derive(Default)]
    pub(crate) struct RefusingConnector {
        pub attempts: AtomicUsize,
    }

    impl Connector for RefusingConnector {
        fn connect(&self, endpoint: &Endpoint) -> Result<Link> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NetworkError::Io(format!("connection to {endpoint} refused")))
        }
    }

    /// Connector that succeeds with the given key and hands out the remote ends
    struct LoopbackConnector {
        key: Vec<u8>,
        remotes: Sender<TcpStream>,
    }

    impl Connector for LoopbackConnector {
        fn connect(&self, endpoint: &Endpoint) -> Result<Link> {
            let (local, remote, _) = socket_pair();
            let _ = self.remotes.send(remote);
            Ok(Link {
                stream: local,
                identity: identity(&self.key, endpoint.port()),
                endpoint: endpoint.clone(),
                direction: Direction::Outbound,
            })
        }
    }

    fn fast_config(attempts: u32) -> PeerConfig {
        PeerConfig {
            reconnect_attempts: attempts,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            chunk_size: 1024,
        }
    }

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_send_and_receive() {
        let (link, mut remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let peer = Peer::start(
            1,
            link,
            Arc::new(RefusingConnector::default()),
            fast_config(1),
            events_tx,
        )
        .unwrap();
        assert!(peer.is_available());

        // Large enough to be chunked on the way in
        let inbound = Message::new(MessageType::Block.tag(), vec![7u8; 5000]);
        write_message(&mut remote, &inbound, 1024).unwrap();
        match events_rx.recv_timeout(WAIT).unwrap() {
            PeerEvent::Message { peer: id, message } => {
                assert_eq!(id, 1);
                assert_eq!(message, inbound);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(peer.packets_received_count(), 1);

        peer.send(Message::new(MessageType::Transaction.tag(), b"tx".to_vec()))
            .unwrap();
        remote.set_read_timeout(Some(WAIT)).unwrap();
        match read_frame(&mut remote).unwrap() {
            Frame::Whole(m) => assert_eq!(m.payload, b"tx".to_vec()),
            other => panic!("unexpected frame {other:?}"),
        }
        peer.disconnect();
    }

    #[test]
    fn test_disconnect_is_idempotent_and_unsubscribes() {
        let (link, _remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let peer = Peer::start(2, link, connector.clone(), fast_config(3), events_tx).unwrap();

        assert!(peer.disconnect());
        assert!(!peer.disconnect());
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(matches!(
            peer.send(Message::new(3, vec![])),
            Err(NetworkError::NotConnected(_))
        ));

        // No reconnect and no events once the handler is gone
        assert!(events_rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_to_closed_connection_never_blocks() {
        let (link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let peer = Peer::start(
            3,
            link,
            Arc::new(RefusingConnector::default()),
            fast_config(1),
            events_tx,
        )
        .unwrap();
        drop(remote);

        let (done_tx, done_rx) = unbounded();
        let started = Instant::now();
        for _ in 0..20 {
            let done_tx = done_tx.clone();
            let _ = peer.send_with_callback(
                Message::new(3, vec![0u8; 512]),
                Box::new(move |result| {
                    let _ = done_tx.send(result);
                }),
            );
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        // Failure shows up asynchronously, either per message or as the
        // peer giving up
        let mut saw_failure = false;
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline && !saw_failure {
            if let Ok(Err(_)) = done_rx.recv_timeout(Duration::from_millis(20)) {
                saw_failure = true;
            }
            if let Ok(PeerEvent::Unreachable { .. }) = events_rx.try_recv() {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[test]
    fn test_reconnect_exhaustion_reports_unreachable() {
        let (link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let peer = Peer::start(4, link, connector.clone(), fast_config(2), events_tx).unwrap();

        drop(remote);
        match events_rx.recv_timeout(WAIT).unwrap() {
            PeerEvent::Unreachable { peer: id, .. } => assert_eq!(id, 4),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_reconnect_restores_fresh_session() {
        let (link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let (remotes_tx, remotes_rx) = unbounded();
        let connector = Arc::new(LoopbackConnector {
            key: b"remote-key".to_vec(),
            remotes: remotes_tx,
        });
        let peer = Peer::start(5, link, connector, fast_config(3), events_tx).unwrap();

        drop(remote);
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Reconnected { peer: 5 }
        ));
        assert!(peer.is_available());

        let mut fresh = remotes_rx.recv_timeout(WAIT).unwrap();
        write_message(&mut fresh, &Message::new(5, b"again".to_vec()), 1024).unwrap();
        match events_rx.recv_timeout(WAIT).unwrap() {
            PeerEvent::Message { message, .. } => assert_eq!(message.payload, b"again".to_vec()),
            other => panic!("unexpected event {other:?}"),
        }
        peer.disconnect();
    }

    #[test]
    fn test_reconnect_rejects_changed_key() {
        let (link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let (remotes_tx, _remotes_rx) = unbounded();
        let connector = Arc::new(LoopbackConnector {
            key: b"impostor".to_vec(),
            remotes: remotes_tx,
        });
        let _peer = Peer::start(6, link, connector, fast_config(2), events_tx).unwrap();

        drop(remote);
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Unreachable {
                cause: NetworkError::Handshake(_),
                ..
            }
        ));
    }

    #[test]
    fn test_protocol_error_is_counted() {
        let (link, mut remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let peer = Peer::start(
            7,
            link,
            Arc::new(RefusingConnector::default()),
            fast_config(1),
            events_tx,
        )
        .unwrap();

        // Chunk flag must be 0 or 1
        remote.write_all(&[3, 9, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Unreachable { .. }
        ));
        assert_eq!(peer.failed_protocol_count(), 1);
        assert_eq!(peer.packets_received_count(), 0);
    }

    #[test]
    fn test_disconnect_cancels_pending_reconnect() {
        let (link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let config = PeerConfig {
            reconnect_delay: Duration::from_secs(30),
            ..fast_config(3)
        };
        let peer = Peer::start(8, link, connector.clone(), config, events_tx).unwrap();

        drop(remote);
        assert!(wait_until(|| peer.state() == PeerState::Reconnecting));
        assert!(matches!(
            peer.send(Message::new(3, vec![])),
            Err(NetworkError::NotConnected(_))
        ));

        peer.disconnect();
        assert!(events_rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_goodbye_from_remote_skips_reconnect() {
        let (link, mut remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let peer = Peer::start(9, link, connector.clone(), fast_config(3), events_tx).unwrap();

        write_message(&mut remote, &disconnect_message(), 1024).unwrap();
        drop(remote);

        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Message { .. }
        ));
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Unreachable { .. }
        ));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_inbound_peer_resumes_on_adopted_stream() {
        let (mut link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        link.direction = Direction::Inbound;
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let config = PeerConfig {
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(1),
            ..fast_config(3)
        };
        let peer = Peer::start(10, link, connector.clone(), config, events_tx).unwrap();

        // Nothing to resume while the link is up
        let (spare, _spare_remote, _) = socket_pair();
        assert!(!peer.adopt(spare).unwrap());

        drop(remote);
        assert!(wait_until(|| peer.state() == PeerState::Reconnecting));
        let (local, mut fresh, _) = socket_pair();
        assert!(peer.adopt(local).unwrap());
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Reconnected { peer: 10 }
        ));
        assert!(peer.is_available());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        write_message(&mut fresh, &Message::new(5, b"back".to_vec()), 1024).unwrap();
        match events_rx.recv_timeout(WAIT).unwrap() {
            PeerEvent::Message { message, .. } => assert_eq!(message.payload, b"back".to_vec()),
            other => panic!("unexpected event {other:?}"),
        }
        peer.disconnect();
    }

    #[test]
    fn test_inbound_peer_waits_instead_of_dialing() {
        let (mut link, remote) = test_link(b"remote-key", "127.0.0.1", 7000);
        link.direction = Direction::Inbound;
        let (events_tx, events_rx) = unbounded();
        let connector = Arc::new(RefusingConnector::default());
        let peer = Peer::start(11, link, connector.clone(), fast_config(2), events_tx).unwrap();

        drop(remote);
        assert!(matches!(
            events_rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::Unreachable { peer: 11, .. }
        ));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(peer.state(), PeerState::Disconnected);

        let (late, _late_remote, _) = socket_pair();
        assert!(!peer.adopt(late).unwrap());
    }
}
