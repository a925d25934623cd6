//! # Transport endpoint
//!
//! One connected message channel: a TCP stream plus the bookkeeping a
//! pooled endpoint needs to detect a peer-initiated shutdown and to share
//! a protection domain with its siblings. Grounded directly on the
//! teacher's `TcpSocketTransport::{read_message, write_message}` — a
//! `u32` little-endian length prefix followed by the payload — generalized
//! from a single bincode blob to this crate's [`Message`] frames, and on
//! its `WRITE_TIMEOUT`-guarded write to avoid blocking forever on a
//! wedged peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{Message, HEADER_LEN};
use crate::error::{CoreError, CoreResult};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoint lifecycle. `Idle` only exists before `Endpoint::connect`
/// returns; every live endpoint in the pool is `Ready` until it observes a
/// shutdown condition or `close` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    Ready,
    ShuttingDown,
    Closed,
}

/// Reference-counted holder for resources shared by every endpoint
/// connected to the same `(provider, server)` pair. The original
/// implementation's libfabric protection domain has no analogue over
/// plain TCP, but the ref-counting discipline — `ref` on build, `unref`
/// on close, free on last unref — is preserved as the shared handle an
/// `Arc` already gives us for free.
#[derive(Debug)]
pub struct ProtectionDomain {
    pub server: SocketAddr,
}

/// A single connected message channel.
pub struct Endpoint {
    stream: TcpStream,
    domain: Arc<ProtectionDomain>,
    shutdown_observed: AtomicBool,
    state: EndpointState,
}

impl Endpoint {
    /// Resolves `host:port`, trying each resolved address in turn (with the
    /// documented `127.0.1.1` → `127.0.0.1` loopback-alias workaround
    /// applied before connecting) and keeping the first address that
    /// accepts a connection.
    pub async fn connect(host: &str, port: u16) -> CoreResult<Self> {
        use tokio::net::lookup_host;

        let host = crate::config::normalize_loopback_alias(host);
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| CoreError::Transport(format!("resolving {host}:{port}: {e}")))?
            .collect();

        if addrs.is_empty() {
            return Err(CoreError::Transport(format!(
                "no addresses resolved for {host}:{port}"
            )));
        }

        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "endpoint connected");
                    return Ok(Self {
                        stream,
                        domain: Arc::new(ProtectionDomain { server: *addr }),
                        shutdown_observed: AtomicBool::new(false),
                        state: EndpointState::Ready,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(CoreError::Transport(format!(
            "failed to connect to any resolved address for {host}:{port}: {:?}",
            last_err
        )))
    }

    pub fn from_stream(stream: TcpStream, domain: Arc<ProtectionDomain>) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            domain,
            shutdown_observed: AtomicBool::new(false),
            state: EndpointState::Ready,
        }
    }

    pub fn domain(&self) -> &Arc<ProtectionDomain> {
        &self.domain
    }

    /// Non-blocking probe: true iff a prior send/receive observed the peer
    /// going away.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_observed.load(Ordering::Acquire) || self.state == EndpointState::Closed
    }

    fn mark_shutdown(&self) {
        self.shutdown_observed.store(true, Ordering::Release);
    }

    /// Sends one framed message, awaiting completion of the underlying
    /// write. Bounded by [`WRITE_TIMEOUT`] so a wedged peer surfaces a
    /// transport error instead of hanging the caller forever.
    pub async fn send(&mut self, message: &Message) -> CoreResult<()> {
        let frame = message.encode();
        let write_fut = async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write_fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_shutdown();
                Err(CoreError::Transport(e.to_string()))
            }
            Err(_) => {
                warn!("send timed out, treating peer as unresponsive");
                self.mark_shutdown();
                Err(CoreError::Transport("write timed out".into()))
            }
        }
    }

    /// Awaits and decodes one reply frame.
    pub async fn receive(&mut self) -> CoreResult<Message> {
        let mut header = [0u8; HEADER_LEN];
        let read_fut = self.stream.read_exact(&mut header);
        match timeout(READ_TIMEOUT, read_fut).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.mark_shutdown();
                return Err(CoreError::Transport(e.to_string()));
            }
            Err(_) => {
                self.mark_shutdown();
                return Err(CoreError::Transport("read timed out".into()));
            }
        }

        let (mut message, body_len) = Message::decode_header(&header)?;
        let mut body = vec![0u8; body_len as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| {
                self.mark_shutdown();
                CoreError::Transport(e.to_string())
            })?;
        message.body = bytes::BytesMut::from(&body[..]);
        Ok(message)
    }

    /// Tears the endpoint down. When `send_shutdown` is set, first sends a
    /// zero-operation wake-up `Ping` frame so a thread blocked in a
    /// server-side receive notices the close, matching the original's
    /// wake-up-then-shutdown close sequence.
    pub async fn close(mut self, send_shutdown: bool) {
        if send_shutdown && !self.is_shutdown() {
            let wakeup = Message::request(crate::codec::MessageType::Ping, 0);
            let _ = self.send(&wakeup).await;
        }
        self.state = EndpointState::Closed;
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("domain", &self.domain)
            .field("state", &self.state)
            .field("shutdown_observed", &self.is_shutdown())
            .finish()
    }
}
