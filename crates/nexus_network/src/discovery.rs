//! The discovery loop.
//!
//! The node advertises itself under the network key once on start. Each
//! cycle then reads the advertisement, probes every address it has not
//! probed before and publishes again to keep the entry fresh. Other nodes
//! write during the wait between cycles, so the next read sees them.
//! After a failed cycle the loop advertises again before reading. Failures
//! never end the loop:
//! directory and payload problems degrade to "no peers this cycle", and
//! anything else (including a panic) lands in a fixed error backoff.
//!
//! The loop exclusively owns its [`SeenPeers`] and [`PeerRegistry`].
//! Observers get read-only [`DiscoveryStatus`] snapshots over a watch
//! channel.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::directory::DirectorySession;
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::local_addr::LocalAddress;
use crate::network_key::NetworkKey;
use crate::peer::{KnownPeer, PeerAdvertisement, PeerRecord, PeerRegistry, SeenPeers};
use crate::probe::Prober;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    Starting,
    Advertising,
    Discovering,
    Idle,
    ErrorBackoff,
    Stopped,
}

/// Read-only snapshot of the loop, republished on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub node_id: NodeId,
    pub network_key: NetworkKey,
    /// The advertised record, or `None` while the local address is unknown.
    pub local: Option<PeerRecord>,
    pub phase: DiscoveryPhase,
    /// Cycles that ran to completion, including "no peers yet" cycles.
    pub cycles: u64,
    /// Cycles that ended in an error or a panic.
    pub failed_cycles: u64,
    /// Number of distinct addresses ever probed.
    pub seen: usize,
    pub peers: Vec<KnownPeer>,
    pub alive: usize,
    /// Alive peers confirmed within the configured active window.
    pub active: usize,
    /// Error of the most recent cycle, cleared by the next clean one.
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Result of one discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was published under the key, or it could not be read.
    NoPeers,
    /// The advertisement was read and new addresses were probed.
    Completed {
        /// Addresses probed for the first time this cycle.
        discovered: Vec<PeerRecord>,
        /// The subset of `discovered` that answered.
        confirmed: Vec<PeerRecord>,
    },
}

/// Timings the loop needs from [`NetworkConfig`].
#[derive(Debug, Clone)]
struct Timings {
    cycle_interval: Duration,
    idle_retry_interval: Duration,
    error_backoff: Duration,
    active_window: Duration,
}

/// Drives discovery for one node.
pub struct DiscoveryLoop {
    key: NetworkKey,
    local: Option<PeerRecord>,
    session: Box<dyn DirectorySession>,
    prober: Arc<dyn Prober>,
    seen: SeenPeers,
    registry: PeerRegistry,
    timings: Timings,
    /// Cleared on failure so the next cycle starts by advertising.
    advertised: bool,
    status_tx: watch::Sender<DiscoveryStatus>,
}

impl DiscoveryLoop {
    /// Build a loop advertising `local` on `ping_port`, using a directory
    /// session that has already been joined.
    pub fn new(
        config: &NetworkConfig,
        node_id: NodeId,
        local: LocalAddress,
        session: Box<dyn DirectorySession>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let key = NetworkKey::derive(&config.namespace);
        let local = local
            .ip()
            .map(|ip| PeerRecord::from_socket_addr(SocketAddr::new(ip, config.ping_port)));
        if local.is_none() {
            warn!("Local address unknown; this node will not advertise itself");
        }

        let (status_tx, _) = watch::channel(DiscoveryStatus {
            node_id,
            network_key: key.clone(),
            local: local.clone(),
            phase: DiscoveryPhase::Starting,
            cycles: 0,
            failed_cycles: 0,
            seen: 0,
            peers: Vec::new(),
            alive: 0,
            active: 0,
            last_error: None,
            started_at: Utc::now(),
        });

        Self {
            key,
            local,
            session,
            prober,
            seen: SeenPeers::with_reprobe_after(config.reprobe_after),
            registry: PeerRegistry::new(),
            timings: Timings {
                cycle_interval: config.cycle_interval,
                idle_retry_interval: config.idle_retry_interval,
                error_backoff: config.error_backoff,
                active_window: config.active_window,
            },
            advertised: false,
            status_tx,
        }
    }

    pub fn network_key(&self) -> &NetworkKey {
        &self.key
    }

    pub fn local_record(&self) -> Option<&PeerRecord> {
        self.local.as_ref()
    }

    pub fn seen(&self) -> &SeenPeers {
        &self.seen
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status_tx.subscribe()
    }

    /// Publish the one-element advertisement describing this node.
    pub async fn advertise(&mut self) -> Result<(), NetworkError> {
        self.set_phase(DiscoveryPhase::Advertising);
        let Some(local) = self.local.clone() else {
            trace!("Skipping advertisement, local address unknown");
            return Ok(());
        };

        let payload = PeerAdvertisement::single(local).encode()?;
        self.session.publish(&self.key, payload).await?;
        self.advertised = true;
        debug!("Advertised under {}", self.key.short());
        Ok(())
    }

    /// Read the advertisement and probe every address not probed before.
    pub async fn discover(&mut self) -> CycleOutcome {
        self.set_phase(DiscoveryPhase::Discovering);

        let payload = match self.session.fetch(&self.key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                info!("No peers yet");
                return CycleOutcome::NoPeers;
            }
            Err(e) => {
                warn!("Peer lookup failed: {e}");
                return CycleOutcome::NoPeers;
            }
        };

        let advertisement = PeerAdvertisement::decode_lossy(&payload);
        let candidates = self.select_candidates(advertisement.records());

        for (record, _) in &candidates {
            info!("New peer found: {record}");
            self.registry.begin_probe(record);
        }
        self.publish_status();

        let prober = Arc::clone(&self.prober);
        let latencies = join_all(candidates.iter().map(|(_, addr)| prober.probe(*addr))).await;

        let mut discovered = Vec::with_capacity(candidates.len());
        let mut confirmed = Vec::new();
        for ((record, _), latency) in candidates.into_iter().zip(latencies) {
            self.registry.finish_probe(&record, latency);
            match latency {
                Some(rtt) => {
                    info!(
                        "Peer {record} is alive ({:.1} ms)",
                        rtt.as_secs_f64() * 1000.0
                    );
                    confirmed.push(record.clone());
                }
                None => debug!("Peer {record} did not answer"),
            }
            discovered.push(record);
        }

        CycleOutcome::Completed {
            discovered,
            confirmed,
        }
    }

    /// One full cycle: discover, then refresh the advertisement. Advertises
    /// first when nothing has been published yet or the last cycle failed.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, NetworkError> {
        if !self.advertised {
            self.advertise().await?;
        }
        let outcome = self.discover().await;
        if matches!(outcome, CycleOutcome::Completed { .. }) {
            self.advertise().await?;
        }
        Ok(outcome)
    }

    /// Run cycles until `shutdown` fires, then leave the directory.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Discovery started (network key {}, advertising {})",
            self.key.short(),
            self.local
                .as_ref()
                .map_or_else(|| "nothing".to_string(), |r| r.to_string())
        );

        loop {
            let result = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
            let wait = match result {
                Ok(Ok(outcome)) => {
                    self.finish_cycle(None);
                    match outcome {
                        CycleOutcome::NoPeers => self.timings.idle_retry_interval,
                        CycleOutcome::Completed { .. } => self.timings.cycle_interval,
                    }
                }
                Ok(Err(e)) => {
                    error!("Discovery cycle failed: {e}");
                    self.finish_cycle(Some(e.to_string()));
                    self.timings.error_backoff
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Discovery cycle panicked: {message}");
                    self.finish_cycle(Some(format!("panic: {message}")));
                    self.timings.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!("Discovery loop shutting down");
                    break;
                }
            }
        }

        self.session.leave().await;
        self.set_phase(DiscoveryPhase::Stopped);
        info!("Discovery stopped after {} cycles", self.status_tx.borrow().cycles);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Filter fetched records down to contactable, unseen, non-self
    /// addresses, marking each selected one as seen.
    fn select_candidates(&mut self, records: &[PeerRecord]) -> Vec<(PeerRecord, SocketAddr)> {
        let now = Instant::now();
        let mut candidates = Vec::new();
        for record in records {
            if self.local.as_ref() == Some(record) {
                trace!("Skipping own advertisement");
                continue;
            }
            let Some(addr) = record.socket_addr() else {
                debug!("Skipping uncontactable peer {record}");
                continue;
            };
            if !self.seen.mark(record, now) {
                trace!("Already probed {record}");
                continue;
            }
            candidates.push((record.clone(), addr));
        }
        candidates
    }

    fn finish_cycle(&mut self, failure: Option<String>) {
        let phase = if failure.is_some() {
            DiscoveryPhase::ErrorBackoff
        } else {
            DiscoveryPhase::Idle
        };
        if failure.is_some() {
            self.advertised = false;
        }
        self.status_tx.send_modify(|status| {
            if failure.is_some() {
                status.failed_cycles += 1;
            } else {
                status.cycles += 1;
            }
            status.last_error = failure;
        });
        self.set_phase(phase);
    }

    fn set_phase(&self, phase: DiscoveryPhase) {
        self.status_tx.send_modify(|status| status.phase = phase);
        self.publish_status();
    }

    fn publish_status(&self) {
        let peers: Vec<KnownPeer> = self.registry.list_all().into_iter().cloned().collect();
        let alive = self.registry.alive_count();
        let active = self
            .registry
            .active_count(self.timings.active_window, Utc::now());
        let seen = self.seen.len();
        self.status_tx.send_modify(|status| {
            status.peers = peers;
            status.alive = alive;
            status.active = active;
            status.seen = seen;
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, PeerDirectory};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProber {
        probed: Mutex<Vec<SocketAddr>>,
        alive: Vec<SocketAddr>,
    }

    #[async_trait]
    impl Prober for RecordingProber {
        async fn probe(&self, addr: SocketAddr) -> Option<Duration> {
            self.probed.lock().push(addr);
            self.alive
                .contains(&addr)
                .then_some(Duration::from_millis(3))
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            namespace: "v1".to_string(),
            ping_port: 42101,
            ..NetworkConfig::default()
        }
    }

    async fn discovery_loop(
        directory: &MemoryDirectory,
        local: &str,
        prober: Arc<RecordingProber>,
    ) -> DiscoveryLoop {
        let session = directory.join(0).await.unwrap();
        DiscoveryLoop::new(
            &config(),
            NodeId::from_fingerprint("test"),
            LocalAddress::Known(local.parse().unwrap()),
            session,
            prober,
        )
    }

    #[tokio::test]
    async fn test_advertise_writes_own_record() {
        let directory = MemoryDirectory::new();
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::default()).await;

        dl.advertise().await.unwrap();
        let stored = directory.get(&NetworkKey::derive("v1")).unwrap();
        assert_eq!(stored, br#"[{"ip":"10.0.0.1","port":42101}]"#);
    }

    #[tokio::test]
    async fn test_empty_directory_is_no_peers() {
        let directory = MemoryDirectory::new();
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::default()).await;

        assert_eq!(dl.discover().await, CycleOutcome::NoPeers);
        assert_eq!(dl.status().phase, DiscoveryPhase::Discovering);
    }

    #[tokio::test]
    async fn test_full_cycle_skips_self() {
        let directory = MemoryDirectory::new();
        let prober = Arc::new(RecordingProber::default());
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::clone(&prober)).await;

        let outcome = dl.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                discovered: vec![],
                confirmed: vec![],
            }
        );
        assert!(prober.probed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_steady_cycle_reads_before_publishing() {
        let directory = MemoryDirectory::new();
        let prober = Arc::new(RecordingProber::default());
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::clone(&prober)).await;
        let key = NetworkKey::derive("v1");

        dl.run_cycle().await.unwrap();
        // Another node writes while this one waits.
        directory.put(&key, r#"[{"ip":"10.0.0.2","port":42101}]"#);
        let outcome = dl.run_cycle().await.unwrap();

        let other = PeerRecord::new("10.0.0.2", 42101);
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                discovered: vec![other],
                confirmed: vec![],
            }
        );
        assert_eq!(
            directory.get(&key).unwrap(),
            br#"[{"ip":"10.0.0.1","port":42101}]"#
        );
    }

    #[tokio::test]
    async fn test_failed_cycle_readvertises_and_clean_cycle_clears_error() {
        let directory = MemoryDirectory::new();
        let prober = Arc::new(RecordingProber::default());
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::clone(&prober)).await;
        let status = dl.subscribe();

        dl.run_cycle().await.unwrap();
        dl.finish_cycle(Some("store unreachable".to_string()));
        assert_eq!(status.borrow().phase, DiscoveryPhase::ErrorBackoff);
        assert_eq!(status.borrow().failed_cycles, 1);
        assert_eq!(
            status.borrow().last_error.as_deref(),
            Some("store unreachable")
        );

        // Recovery publishes before reading, so the stale entry is replaced.
        directory.put(
            &NetworkKey::derive("v1"),
            r#"[{"ip":"10.0.0.2","port":42101}]"#,
        );
        dl.run_cycle().await.unwrap();
        assert!(prober.probed.lock().is_empty());

        dl.finish_cycle(None);
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.failed_cycles, 1);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_discover_updates_registry_and_status() {
        let directory = MemoryDirectory::new();
        let peer: SocketAddr = "10.0.0.2:42101".parse().unwrap();
        let prober = Arc::new(RecordingProber {
            alive: vec![peer],
            ..Default::default()
        });
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::clone(&prober)).await;
        let status = dl.subscribe();

        directory.put(
            &NetworkKey::derive("v1"),
            r#"[{"ip":"10.0.0.2","port":42101},{"ip":"10.0.0.3","port":42101}]"#,
        );
        let outcome = dl.discover().await;

        let CycleOutcome::Completed {
            discovered,
            confirmed,
        } = outcome
        else {
            panic!("expected a completed cycle");
        };
        assert_eq!(discovered.len(), 2);
        assert_eq!(confirmed, vec![PeerRecord::from_socket_addr(peer)]);
        assert_eq!(dl.registry().alive_count(), 1);

        dl.finish_cycle(None);
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.phase, DiscoveryPhase::Idle);
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.seen, 2);
        assert_eq!(snapshot.alive, 1);
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.peers.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_local_address_never_advertised() {
        let directory = MemoryDirectory::new();
        let session = directory.join(0).await.unwrap();
        let mut dl = DiscoveryLoop::new(
            &config(),
            NodeId::from_fingerprint("test"),
            LocalAddress::Unknown,
            session,
            Arc::new(RecordingProber::default()),
        );

        assert_eq!(dl.run_cycle().await.unwrap(), CycleOutcome::NoPeers);
        assert!(directory.is_empty());
        assert!(dl.status().local.is_none());
    }

    #[tokio::test]
    async fn test_uncontactable_records_are_not_probed() {
        let directory = MemoryDirectory::new();
        let prober = Arc::new(RecordingProber::default());
        let mut dl = discovery_loop(&directory, "10.0.0.1", Arc::clone(&prober)).await;

        directory.put(
            &NetworkKey::derive("v1"),
            r#"[{"ip":"0.0.0.0","port":42101},{"ip":"nowhere","port":42101}]"#,
        );
        dl.discover().await;
        assert!(prober.probed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reprobe_after_cooldown() {
        let directory = MemoryDirectory::new();
        let prober = Arc::new(RecordingProber::default());
        let session = directory.join(0).await.unwrap();
        let mut config = config();
        config.reprobe_after = Some(Duration::ZERO);
        let mut dl = DiscoveryLoop::new(
            &config,
            NodeId::from_fingerprint("test"),
            LocalAddress::Known("10.0.0.1".parse().unwrap()),
            session,
            Arc::clone(&prober) as Arc<dyn Prober>,
        );

        directory.put(&NetworkKey::derive("v1"), r#"[{"ip":"10.0.0.2","port":1}]"#);
        dl.discover().await;
        dl.discover().await;
        assert_eq!(prober.probed.lock().len(), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
