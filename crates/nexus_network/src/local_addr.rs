//! Outbound interface address discovery.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// The address this node believes it is reachable at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAddress {
    Known(IpAddr),
    /// Resolution failed. Nothing should be advertised for this address.
    Unknown,
}

impl LocalAddress {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Known(ip) => Some(*ip),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(ip) => write!(f, "{ip}"),
            Self::Unknown => f.write_str("0.0.0.0"),
        }
    }
}

/// Find the address of the interface that routes to `target`.
///
/// "Connecting" a UDP socket only selects a route; no datagram is sent.
pub async fn resolve_local_address(target: SocketAddr) -> LocalAddress {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Local address lookup failed to bind: {e}");
            return LocalAddress::Unknown;
        }
    };

    if let Err(e) = socket.connect(target).await {
        warn!("No route to {target}, local address unknown: {e}");
        return LocalAddress::Unknown;
    }

    match socket.local_addr() {
        Ok(addr) if !addr.ip().is_unspecified() => {
            debug!("Local address resolved to {}", addr.ip());
            LocalAddress::Known(addr.ip())
        }
        Ok(_) => {
            warn!("Route to {target} has no source address, local address unknown");
            LocalAddress::Unknown
        }
        Err(e) => {
            warn!("Local address lookup failed: {e}");
            LocalAddress::Unknown
        }
    }
}
