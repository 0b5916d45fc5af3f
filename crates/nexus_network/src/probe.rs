//! UDP liveness probe and the responder that answers it.
//!
//! The protocol is two fixed 4-byte ASCII datagrams with no framing:
//! a prober sends [`PING`], a responder answers with [`PONG`]. A probe
//! treats *any* datagram from the target within its window as proof of
//! life, so it does not validate the reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;

/// Challenge datagram.
pub const PING: &[u8; 4] = b"PING";
/// Acknowledgment datagram.
pub const PONG: &[u8; 4] = b"PONG";

/// Checks whether an endpoint is reachable.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip latency, or `None` when nothing answered in time.
    async fn probe(&self, addr: SocketAddr) -> Option<Duration>;
}

/// Production [`Prober`]: one `PING`, no retries.
#[derive(Debug, Clone)]
pub struct UdpProber {
    timeout: Duration,
}

impl UdpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Prober for UdpProber {
    async fn probe(&self, addr: SocketAddr) -> Option<Duration> {
        match probe(addr, self.timeout).await {
            Ok(latency) => latency,
            Err(e) => {
                debug!("Probe to {addr} failed: {e}");
                None
            }
        }
    }
}

/// Send a `PING` to `addr` and wait up to `timeout` for any datagram back.
///
/// The socket is left unconnected so that ICMP errors do not end the wait
/// early: a missing listener is only reported once the window elapses.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> Result<Option<Duration>, NetworkError> {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|source| NetworkError::Bind { addr: bind, source })?;

    let started = Instant::now();
    let deadline = started + timeout;
    socket.send_to(PING, addr).await?;
    trace!("PING sent to {addr}");

    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, from))) if from == addr => {
                let latency = started.elapsed();
                debug!("{addr} answered in {:.1} ms", latency.as_secs_f64() * 1000.0);
                return Ok(Some(latency));
            }
            Ok(Ok((_, from))) => trace!("Ignoring datagram from {from} while probing {addr}"),
            Ok(Err(e)) => trace!("recv while probing {addr}: {e}"),
            Err(_) => {
                debug!("No response from {addr} within {timeout:?}");
                return Ok(None);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Counters kept by a running [`Responder`].
#[derive(Debug, Default)]
pub struct ResponderStats {
    pings_answered: AtomicU64,
    pongs_received: AtomicU64,
    ignored: AtomicU64,
}

/// Point-in-time copy of [`ResponderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderCounts {
    pub pings_answered: u64,
    pub pongs_received: u64,
    pub ignored: u64,
}

impl ResponderStats {
    pub fn snapshot(&self) -> ResponderCounts {
        ResponderCounts {
            pings_answered: self.pings_answered.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

/// Answers `PING` with `PONG` on the liveness port.
pub struct Responder {
    socket: UdpSocket,
    stats: Arc<ResponderStats>,
}

impl Responder {
    /// Bind the responder on all interfaces at `port`, in the address family
    /// of `local` so the advertised record is reachable. IPv4 when unknown.
    pub async fn bind(local: Option<IpAddr>, port: u16) -> Result<Self, NetworkError> {
        let any: IpAddr = match local {
            Some(IpAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        Self::bind_addr(SocketAddr::new(any, port)).await
    }

    /// Bind the responder on a specific address.
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        Ok(Self {
            socket,
            stats: Arc::new(ResponderStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ResponderStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until `shutdown` fires. The socket is closed on return.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.socket.local_addr() {
            info!("Liveness responder listening on {addr}");
        }

        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle(&buf[..len], from).await,
                        // Windows reports ICMP port-unreachable from earlier sends here.
                        Err(e) => trace!("Responder recv error: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Liveness responder shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, datagram: &[u8], from: SocketAddr) {
        if datagram == PING {
            match self.socket.send_to(PONG, from).await {
                Ok(_) => {
                    self.stats.pings_answered.fetch_add(1, Ordering::Relaxed);
                    trace!("PONG sent to {from}");
                }
                Err(e) => warn!("Failed to answer PING from {from}: {e}"),
            }
        } else if datagram == PONG {
            self.stats.pongs_received.fetch_add(1, Ordering::Relaxed);
            debug!("PONG from {from}");
        } else {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            trace!("Ignoring {}-byte datagram from {from}", datagram.len());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
