//! UDP transport for node-to-node datagrams
//!
//! Thin wrapper around tokio's UdpSocket with:
//! - Configurable send/receive buffer sizes
//! - One shared listening socket for everything inbound
//! - One connected socket per destination for outbound writes, so a
//!   destination with nothing listening surfaces as `ConnectionRefused`
//! - A [`Link`] implementation so the peer directory can write through it

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Largest datagram a node will read in one call.
///
/// A full game-state snapshot for a few dozen players fits comfortably.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// How long a destination keeps failing writes after it last refused one.
///
/// Refusals arrive asynchronously as ICMP, one pending error per socket, so
/// back-to-back writes would otherwise alternate between refused and sent.
const REFUSAL_HOLD: Duration = Duration::from_secs(1);

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            sndbuf: 1024 * 1024, // 1MB
            rcvbuf: 1024 * 1024, // 1MB
        }
    }
}

impl TransportConfig {
    /// Config bound to the given address with default buffers.
    pub fn bound_to(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }
}

/// Anything that can carry one datagram to one address.
///
/// The peer directory is the only writer; a failed send counts as a strike
/// against the destination peer.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Drop any per-destination resources held for `addr`.
    async fn release(&self, _addr: SocketAddr) {}
}

fn bind_socket(addr: SocketAddr, sndbuf: usize, rcvbuf: usize) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Set buffer sizes before binding
    socket.set_send_buffer_size(sndbuf)?;
    socket.set_recv_buffer_size(rcvbuf)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Outbound socket connected to a single destination.
struct PeerSocket {
    socket: UdpSocket,
    refused_at: Mutex<Option<Instant>>,
}

impl PeerSocket {
    fn connect(peer: SocketAddr, sndbuf: usize) -> io::Result<Self> {
        // Any local address; replies go to the listening socket.
        let local = match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = bind_socket(SocketAddr::new(local, 0), sndbuf, sndbuf)?;
        socket.connect(&peer.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            refused_at: Mutex::new(None),
        })
    }

    /// Write one datagram. Fails if this write or an earlier one was
    /// refused within [`REFUSAL_HOLD`]; the datagram is sent regardless.
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let pending = self.socket.take_error()?;
        let result = match self.socket.send(data).await {
            Ok(_) => pending.map_or(Ok(()), Err),
            Err(e) => Err(e),
        };

        let mut refused_at = self.refused_at.lock().await;
        match result {
            Err(e) => {
                if e.kind() == io::ErrorKind::ConnectionRefused {
                    *refused_at = Some(Instant::now());
                }
                Err(e)
            }
            Ok(()) => match *refused_at {
                Some(at) if at.elapsed() < REFUSAL_HOLD => {
                    Err(io::ErrorKind::ConnectionRefused.into())
                }
                _ => {
                    *refused_at = None;
                    Ok(())
                }
            },
        }
    }
}

/// Internal UDP transport implementation
pub(crate) struct UdpTransport {
    socket: UdpSocket,
    sndbuf: usize,
    peers: Mutex<HashMap<SocketAddr, Arc<PeerSocket>>>,
}

impl UdpTransport {
    /// Bind to the given address with configured buffer sizes
    pub async fn bind(addr: SocketAddr, sndbuf: usize, rcvbuf: usize) -> anyhow::Result<Self> {
        let socket = bind_socket(addr, sndbuf, rcvbuf)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;

        tracing::info!(
            "UDP transport bound to {} (sndbuf={}, rcvbuf={})",
            tokio_socket.local_addr()?,
            sndbuf,
            rcvbuf
        );

        Ok(Self {
            socket: tokio_socket,
            sndbuf,
            peers: Mutex::new(HashMap::new()),
        })
    }

    async fn peer_socket(&self, addr: SocketAddr) -> io::Result<Arc<PeerSocket>> {
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get(&addr) {
            return Ok(Arc::clone(peer));
        }
        let peer = Arc::new(PeerSocket::connect(addr, self.sndbuf)?);
        tracing::debug!(%addr, "opened outbound socket");
        peers.insert(addr, Arc::clone(&peer));
        Ok(peer)
    }
}

/// Cloneable handle for sending and receiving datagrams
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<UdpTransport>,
}

impl TransportHandle {
    /// Create a new transport handle with the given configuration
    pub async fn new(cfg: TransportConfig) -> anyhow::Result<Self> {
        let transport = UdpTransport::bind(cfg.bind, cfg.sndbuf, cfg.rcvbuf).await?;
        Ok(Self {
            inner: Arc::new(transport),
        })
    }

    /// Receive raw bytes from any sender
    pub async fn recv_raw(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let (len, addr) = self.inner.socket.recv_from(buf).await?;
        Ok((len, addr))
    }

    /// Get the local address this transport is bound to
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }
}

#[async_trait]
impl Link for TransportHandle {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.inner.peer_socket(addr).await?.send(data).await
    }

    async fn release(&self, addr: SocketAddr) {
        if self.inner.peers.lock().await.remove(&addr).is_some() {
            tracing::debug!(%addr, "closed outbound socket");
        }
    }
}
