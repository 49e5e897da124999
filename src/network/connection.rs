//! Raw connections: outbound dialing with a timeout and the inbound listener

use crate::error::{NetworkError, Result};
use crate::network::handshake::{Handshaker, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::network::node::{Endpoint, PeerIdentity};
use log::{debug, error, info};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An authenticated connection, ready to become a peer
#[derive(Debug)]
pub struct Link {
    pub stream: TcpStream,
    pub identity: PeerIdentity,
    /// Where the remote node listens
    pub endpoint: Endpoint,
    pub direction: Direction,
}

/// Produces authenticated links to remote endpoints.
///
/// The pool dials through this seam and peers use it to reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Link>;
}

/// Opens TCP connections, giving up after `timeout`
#[derive(Debug, Clone)]
pub struct Dialer {
    timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn dial(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let mut last_error = None;
        for addr in endpoint.resolve()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Dialed {endpoint} ({addr})");
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) if e.kind() == ErrorKind::TimedOut => {
                NetworkError::Timeout(format!("Dial to {endpoint} timed out"))
            }
            Some(e) => NetworkError::Io(format!("Failed to connect to {endpoint}: {e}")),
            None => NetworkError::Io(format!("No address to dial for {endpoint}")),
        })
    }
}

/// Dials and performs the initiating side of the handshake
#[derive(Clone)]
pub struct HandshakeConnector {
    dialer: Dialer,
    handshaker: Handshaker,
    handshake_timeout: Duration,
}

impl HandshakeConnector {
    pub fn new(dialer: Dialer, handshaker: Handshaker) -> Self {
        Self {
            dialer,
            handshaker,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Connector for HandshakeConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Link> {
        let mut stream = self.dialer.dial(endpoint)?;
        stream.set_read_timeout(Some(self.handshake_timeout))?;
        stream.set_write_timeout(Some(self.handshake_timeout))?;
        let identity = self.handshaker.initiate(&mut stream)?;
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        Ok(Link {
            stream,
            identity,
            endpoint: endpoint.clone(),
            direction: Direction::Outbound,
        })
    }
}

/// Accepts inbound TCP connections
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind the listening socket; failure here is fatal for the node
    pub fn bind(addr: &str) -> Result<Listener> {
        let listener =
            TcpListener::bind(addr).map_err(|e| NetworkError::Bind(format!("{addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| NetworkError::Bind(format!("{addr}: {e}")))?;
        Ok(Listener { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `exit` is set, handing each to `on_connection`
    pub fn run<F>(&self, exit: &AtomicBool, mut on_connection: F)
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        if let Ok(addr) = self.local_addr() {
            info!("Listening for peers on {addr}");
        }
        while !exit.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("Failed to configure connection from {addr}: {e}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!("Incoming connection from {addr}");
                    on_connection(stream, addr);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        debug!("Listener stopped");
    }

    /// Run the accept loop on its own thread
    pub fn spawn<F>(self, exit: Arc<AtomicBool>, on_connection: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnMut(TcpStream, SocketAddr) + Send + 'static,
    {
        thread::Builder::new()
            .name("peerwireAccept".to_string())
            .spawn(move || self.run(&exit, on_connection))
            .map_err(|e| NetworkError::Io(format!("Failed to spawn listener thread: {e}")))
    }
}
