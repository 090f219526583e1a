use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;
use url::Url;

/// Large enough for a 20-byte announce header plus 337 IPv4 peers.
pub const MAX_DATAGRAM: usize = 2048;

/// Upper bound on a single blocking read, so cancellation is noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("UDP socket error: {0}")]
    Io(#[from] io::Error),
    #[error("Unsupported tracker URL '{0}'")]
    UnsupportedUrl(String),
    #[error("Could not resolve tracker address '{0}'")]
    Unresolved(String),
    #[error("No response from tracker within {0:?}")]
    Timeout(Duration),
    #[error("Tracker sent an empty datagram")]
    EmptyDatagram,
    #[error("Wait was cancelled")]
    Cancelled,
}

/// A datagram channel to one tracker.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram, returning at most `max_bytes` of it.
    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Shared flag that aborts pending waits on every transport holding a clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    cancel: CancelToken,
}

impl UdpTransport {
    /// Resolves a `udp://host:port[/path]` tracker URL and connects a fresh socket to it.
    pub fn connect(tracker_url: &str, cancel: CancelToken) -> Result<Self, TransportError> {
        let url = Url::parse(tracker_url)
            .map_err(|_| TransportError::UnsupportedUrl(tracker_url.to_string()))?;
        if url.scheme() != "udp" || url.port().is_none() {
            return Err(TransportError::UnsupportedUrl(tracker_url.to_string()));
        }

        let tracker_addr = url
            .socket_addrs(|| None)?
            .into_iter()
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| TransportError::Unresolved(tracker_url.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(tracker_addr)?;
        socket.set_write_timeout(Some(POLL_SLICE))?;
        debug!("UDP socket {} connected to {}", socket.local_addr()?, tracker_addr);

        Ok(Self { socket, cancel })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.socket.send(bytes)?;
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; max_bytes];

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }

            self.socket.set_read_timeout(Some(remaining.min(POLL_SLICE)))?;
            match self.socket.recv(&mut buf) {
                Ok(0) => return Err(TransportError::EmptyDatagram),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
