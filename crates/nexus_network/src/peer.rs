//! Peer records, advertisements, and local bookkeeping of probed peers.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NetworkError;

/// A contactable endpoint. Identity is the `(ip, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Parse into a probe target. Unparsable and unspecified addresses
    /// (`0.0.0.0`, `::`) are not contactable and yield `None`.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        if ip.is_unspecified() || self.port == 0 {
            return None;
        }
        Some(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.ip, self.port),
            _ => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerAdvertisement
// ---------------------------------------------------------------------------

/// The value stored under the network key: a JSON array of `{ip, port}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAdvertisement(pub Vec<PeerRecord>);

impl PeerAdvertisement {
    /// An advertisement describing only `record`.
    pub fn single(record: PeerRecord) -> Self {
        Self(vec![record])
    }

    pub fn records(&self) -> &[PeerRecord] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the UTF-8 JSON stored in the directory.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Strict decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode a fetched value, treating anything malformed as "no peers".
    pub fn decode_lossy(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(ad) => ad,
            Err(e) => {
                warn!("Invalid peer list ({} bytes): {e}", bytes.len());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SeenPeers
// ---------------------------------------------------------------------------

/// Addresses already handed to the liveness probe. Never persisted.
#[derive(Debug, Default)]
pub struct SeenPeers {
    seen: HashMap<PeerRecord, Instant>,
    reprobe_after: Option<Duration>,
}

impl SeenPeers {
    /// A set where every address is probed at most once.
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where an address becomes probe-able again after `cooldown`.
    pub fn with_reprobe_after(cooldown: Option<Duration>) -> Self {
        Self {
            seen: HashMap::new(),
            reprobe_after: cooldown,
        }
    }

    /// Record `record` as probed at `now`. Returns `true` if the caller
    /// should probe it, i.e. it was unseen or its cooldown has expired.
    pub fn mark(&mut self, record: &PeerRecord, now: Instant) -> bool {
        match self.seen.get_mut(record) {
            None => {
                self.seen.insert(record.clone(), now);
                true
            }
            Some(last) => match self.reprobe_after {
                Some(cooldown) if now.saturating_duration_since(*last) >= cooldown => {
                    *last = now;
                    true
                }
                _ => false,
            },
        }
    }

    pub fn contains(&self, record: &PeerRecord) -> bool {
        self.seen.contains_key(record)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PeerRegistry
// ---------------------------------------------------------------------------

/// Liveness state of a discovered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Found in the directory, probe in flight.
    Probing,
    /// Answered the most recent probe.
    Alive,
    /// Did not answer the most recent probe.
    Unresponsive,
}

/// What we know about a discovered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    pub record: PeerRecord,
    pub state: PeerState,
    /// When the peer was first read from the directory.
    pub first_seen: DateTime<Utc>,
    /// Last time the peer answered a probe.
    pub last_seen: Option<DateTime<Utc>>,
    /// Round-trip latency of the most recent successful probe.
    pub latency_ms: Option<f64>,
    /// Number of probes sent.
    pub probes: u32,
}

/// Registry of every peer the discovery loop has probed.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerRecord, KnownPeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a probe for `record` is starting.
    pub fn begin_probe(&mut self, record: &PeerRecord) {
        let peer = self
            .peers
            .entry(record.clone())
            .or_insert_with(|| KnownPeer {
                record: record.clone(),
                state: PeerState::Probing,
                first_seen: Utc::now(),
                last_seen: None,
                latency_ms: None,
                probes: 0,
            });
        peer.state = PeerState::Probing;
        peer.probes += 1;
    }

    /// Apply the probe result for `record`.
    pub fn finish_probe(&mut self, record: &PeerRecord, latency: Option<Duration>) {
        if let Some(peer) = self.peers.get_mut(record) {
            match latency {
                Some(rtt) => {
                    peer.state = PeerState::Alive;
                    peer.last_seen = Some(Utc::now());
                    peer.latency_ms = Some(rtt.as_secs_f64() * 1000.0);
                }
                None => peer.state = PeerState::Unresponsive,
            }
        }
    }

    pub fn get(&self, record: &PeerRecord) -> Option<&KnownPeer> {
        self.peers.get(record)
    }

    /// All known peers, ordered by address for stable output.
    pub fn list_all(&self) -> Vec<&KnownPeer> {
        let mut peers: Vec<&KnownPeer> = self.peers.values().collect();
        peers.sort_by(|a, b| (&a.record.ip, a.record.port).cmp(&(&b.record.ip, b.record.port)));
        peers
    }

    pub fn alive_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Alive)
            .count()
    }

    /// Alive peers that answered within `window` of `now`.
    pub fn active_count(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Alive)
            .filter(|p| p.last_seen.is_some_and(|t| now - t <= window))
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.peers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_wire_format() {
        let ad = PeerAdvertisement::single(PeerRecord::new("10.0.0.1", 42101));
        let bytes = ad.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"[{"ip":"10.0.0.1","port":42101}]"#
        );
    }

    #[test]
    fn test_decode_accepts_foreign_spacing() {
        let ad = PeerAdvertisement::decode_lossy(
            br#"[{"ip": "10.0.0.1", "port": 42101}, {"ip": "10.0.0.2", "port": 42102}]"#,
        );
        assert_eq!(ad.records().len(), 2);
        assert_eq!(ad.records()[1], PeerRecord::new("10.0.0.2", 42102));
    }

    #[test]
    fn test_decode_lossy_malformed_is_empty() {
        assert!(PeerAdvertisement::decode_lossy(b"not json").is_empty());
        assert!(PeerAdvertisement::decode_lossy(br#"{"ip":"10.0.0.1"}"#).is_empty());
        assert!(PeerAdvertisement::decode_lossy(br#"[{"ip":"10.0.0.1","port":99999}]"#).is_empty());
        assert!(PeerAdvertisement::decode_lossy(&[0xff, 0xfe]).is_empty());
        assert!(PeerAdvertisement::decode(b"not json").is_err());
    }

    #[test]
    fn test_record_socket_addr() {
        assert_eq!(
            PeerRecord::new("10.0.0.1", 42101).socket_addr(),
            Some("10.0.0.1:42101".parse().unwrap())
        );
        assert!(PeerRecord::new("0.0.0.0", 42101).socket_addr().is_none());
        assert!(PeerRecord::new("::", 42101).socket_addr().is_none());
        assert!(PeerRecord::new("not-an-ip", 42101).socket_addr().is_none());
        assert!(PeerRecord::new("10.0.0.1", 0).socket_addr().is_none());
    }

    #[test]
    fn test_record_display() {
        assert_eq!(PeerRecord::new("10.0.0.1", 1).to_string(), "10.0.0.1:1");
        assert_eq!(PeerRecord::new("fe80::1", 2).to_string(), "[fe80::1]:2");
    }

    #[test]
    fn test_seen_peers_probe_once() {
        let mut seen = SeenPeers::new();
        let record = PeerRecord::new("10.0.0.1", 42101);
        let now = Instant::now();

        assert!(seen.mark(&record, now));
        assert!(!seen.mark(&record, now + Duration::from_secs(3600)));
        assert!(seen.contains(&record));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_seen_peers_identity_is_ip_and_port() {
        let mut seen = SeenPeers::new();
        let now = Instant::now();
        assert!(seen.mark(&PeerRecord::new("10.0.0.1", 1), now));
        assert!(seen.mark(&PeerRecord::new("10.0.0.1", 2), now));
        assert!(seen.mark(&PeerRecord::new("10.0.0.2", 1), now));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_seen_peers_cooldown() {
        let mut seen = SeenPeers::with_reprobe_after(Some(Duration::from_secs(60)));
        let record = PeerRecord::new("10.0.0.1", 42101);
        let start = Instant::now();

        assert!(seen.mark(&record, start));
        assert!(!seen.mark(&record, start + Duration::from_secs(30)));
        assert!(seen.mark(&record, start + Duration::from_secs(60)));
        assert!(!seen.mark(&record, start + Duration::from_secs(90)));
    }

    #[test]
    fn test_registry_probe_lifecycle() {
        let mut registry = PeerRegistry::new();
        let record = PeerRecord::new("10.0.0.1", 42101);

        registry.begin_probe(&record);
        assert_eq!(registry.get(&record).unwrap().state, PeerState::Probing);

        registry.finish_probe(&record, Some(Duration::from_millis(4)));
        let peer = registry.get(&record).unwrap();
        assert_eq!(peer.state, PeerState::Alive);
        assert_eq!(peer.latency_ms, Some(4.0));
        assert!(peer.last_seen.is_some());

        registry.begin_probe(&record);
        registry.finish_probe(&record, None);
        let peer = registry.get(&record).unwrap();
        assert_eq!(peer.state, PeerState::Unresponsive);
        assert_eq!(peer.probes, 2);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_registry_counts() {
        let mut registry = PeerRegistry::new();
        let alive = PeerRecord::new("10.0.0.1", 1);
        let dead = PeerRecord::new("10.0.0.2", 1);

        registry.begin_probe(&alive);
        registry.finish_probe(&alive, Some(Duration::from_millis(1)));
        registry.begin_probe(&dead);
        registry.finish_probe(&dead, None);

        assert_eq!(registry.alive_count(), 1);
        assert_eq!(registry.active_count(Duration::from_secs(60), Utc::now()), 1);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(registry.active_count(Duration::from_secs(3600), later), 0);
        assert_eq!(registry.list_all()[0].record, alive);
    }
}
