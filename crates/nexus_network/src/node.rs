//! NexusNode: top-level coordinator for discovery.
//!
//! [`NexusNode`] is the primary public API for nexus_network. Starting it:
//! - resolves the outbound interface address,
//! - binds the liveness responder on the ping port,
//! - joins the peer directory on the DHT port,
//! - spawns the responder and the [`DiscoveryLoop`] as independent tasks.
//!
//! The responder never waits on the loop, so inbound pings are answered
//! while a DHT round trip or an outbound probe is in flight.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::directory::{KadDirectory, PeerDirectory};
use crate::discovery::{DiscoveryLoop, DiscoveryStatus};
use crate::error::NetworkError;
use crate::identity::NodeIdentity;
use crate::local_addr::{LocalAddress, resolve_local_address};
use crate::probe::{Prober, Responder, ResponderCounts, ResponderStats, UdpProber};

/// A running (or startable) discovery node.
pub struct NexusNode {
    identity: NodeIdentity,
    config: NetworkConfig,
    directory: Arc<dyn PeerDirectory>,
    prober: Arc<dyn Prober>,
    /// Resolved on start.
    local: LocalAddress,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    status_rx: Option<watch::Receiver<DiscoveryStatus>>,
    responder_stats: Option<Arc<ResponderStats>>,
    running: bool,
}

impl NexusNode {
    /// Create a node that will join `directory` and probe over UDP.
    pub fn new(
        identity: NodeIdentity,
        config: NetworkConfig,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        let prober = Arc::new(UdpProber::new(config.probe_timeout));
        Self {
            identity,
            config,
            directory,
            prober,
            local: LocalAddress::Unknown,
            shutdown_tx: None,
            tasks: Vec::new(),
            status_rx: None,
            responder_stats: None,
            running: false,
        }
    }

    /// Create a node for this machine on the Kademlia DHT.
    pub fn with_defaults(config: NetworkConfig) -> Self {
        let directory = Arc::new(KadDirectory::from_config(&config));
        Self::new(NodeIdentity::detect(), config, directory)
    }

    /// Replace the liveness prober.
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The address resolved by the last [`start`](Self::start).
    pub fn local_address(&self) -> LocalAddress {
        self.local
    }

    /// Latest discovery snapshot, or `None` before the first start.
    pub fn status(&self) -> Option<DiscoveryStatus> {
        self.status_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Follow discovery snapshots as they change.
    pub fn subscribe_status(&self) -> Option<watch::Receiver<DiscoveryStatus>> {
        self.status_rx.clone()
    }

    pub fn responder_stats(&self) -> Option<ResponderCounts> {
        self.responder_stats.as_ref().map(|stats| stats.snapshot())
    }

    /// Start the responder and the discovery loop. A no-op when running.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }

        if self.identity.degraded {
            warn!("Node ID is degraded and may collide with other machines");
        }

        self.local = resolve_local_address(self.config.route_probe_target).await;

        let responder = Responder::bind(self.local.ip(), self.config.ping_port).await?;
        // Advertise the port actually bound, which differs when configured as 0.
        let mut config = self.config.clone();
        config.ping_port = responder.local_addr()?.port();

        let session = self.directory.join(self.config.dht_port).await?;

        let discovery = DiscoveryLoop::new(
            &config,
            self.identity.node_id.clone(),
            self.local,
            session,
            Arc::clone(&self.prober),
        );

        let (shutdown_tx, _) = broadcast::channel(8);
        self.status_rx = Some(discovery.subscribe());
        self.responder_stats = Some(responder.stats());

        self.tasks
            .push(tokio::spawn(responder.run(shutdown_tx.subscribe())));
        self.tasks
            .push(tokio::spawn(discovery.run(shutdown_tx.subscribe())));
        self.shutdown_tx = Some(shutdown_tx);
        self.running = true;

        info!(
            "NexusNode started (node_id: {}, namespace: {}, local: {}:{})",
            self.identity.node_id.short(),
            config.namespace,
            self.local,
            config.ping_port
        );
        Ok(())
    }

    /// Stop both tasks, close the UDP socket and leave the directory.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }

        if self.running {
            info!("NexusNode {} stopped", self.identity.node_id.short());
        } else {
            debug!("NexusNode was not running");
        }
        self.running = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
