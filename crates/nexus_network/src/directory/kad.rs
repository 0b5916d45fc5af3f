//! Kademlia-backed directory.
//!
//! The swarm is owned by a spawned driver task; sessions talk to it over an
//! mpsc command channel and get answers back on oneshot channels keyed by
//! the Kademlia query id.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::kad::{self, GetRecordOk, QueryId, QueryResult, Quorum, Record, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm, noise, tcp, yamux};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{DirectorySession, PeerDirectory};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network_key::NetworkKey;

type KadBehaviour = kad::Behaviour<kad::store::MemoryStore>;

/// Slack on top of the Kademlia query timeout so the query reports its own
/// outcome before the session gives up waiting.
const REPLY_GRACE: Duration = Duration::from_secs(2);

/// Joins a libp2p Kademlia DHT over TCP with noise and yamux.
#[derive(Debug, Clone)]
pub struct KadDirectory {
    bootstrap: Vec<String>,
    query_timeout: Duration,
}

impl KadDirectory {
    /// `bootstrap` entries are multiaddrs ending in `/p2p/<peer id>`.
    pub fn new(bootstrap: Vec<String>, query_timeout: Duration) -> Self {
        Self {
            bootstrap,
            query_timeout,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.dht_bootstrap.clone(), config.dht_query_timeout)
    }

    fn build_swarm(&self) -> Result<Swarm<KadBehaviour>, NetworkError> {
        let query_timeout = self.query_timeout;
        let swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Directory(format!("Transport setup failed: {e}")))?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                let mut config = kad::Config::new(kad::PROTOCOL_NAME);
                config.set_query_timeout(query_timeout);
                let mut behaviour = kad::Behaviour::with_config(
                    peer_id,
                    kad::store::MemoryStore::new(peer_id),
                    config,
                );
                behaviour.set_mode(Some(kad::Mode::Server));
                behaviour
            })
            .map_err(|e| NetworkError::Directory(format!("Behaviour setup failed: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();
        Ok(swarm)
    }

    fn add_bootstrap_peers(&self, swarm: &mut Swarm<KadBehaviour>) -> usize {
        let mut added = 0;
        for entry in &self.bootstrap {
            let addr: Multiaddr = match entry.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Ignoring bootstrap peer {entry}: {e}");
                    continue;
                }
            };
            match addr.iter().last() {
                Some(Protocol::P2p(peer_id)) => {
                    swarm.behaviour_mut().add_address(&peer_id, addr);
                    added += 1;
                }
                _ => warn!("Ignoring bootstrap peer {entry}: missing /p2p/<peer id>"),
            }
        }
        added
    }
}

#[async_trait]
impl PeerDirectory for KadDirectory {
    async fn join(&self, listen_port: u16) -> Result<Box<dyn DirectorySession>, NetworkError> {
        let mut swarm = self.build_swarm()?;
        let local_peer_id = *swarm.local_peer_id();

        let listen_addr = Multiaddr::from(Ipv4Addr::UNSPECIFIED).with(Protocol::Tcp(listen_port));
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::Bind {
                addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port)),
                source: io::Error::other(e.to_string()),
            })?;

        if self.add_bootstrap_peers(&mut swarm) > 0 {
            if let Err(e) = swarm.behaviour_mut().bootstrap() {
                warn!("DHT bootstrap could not start: {e}");
            }
        } else {
            debug!("No DHT bootstrap peers configured");
        }

        info!("Joined DHT as {local_peer_id} on tcp port {listen_port}");

        let (command_tx, command_rx) = mpsc::channel(32);
        let driver = SwarmDriver {
            swarm,
            commands: command_rx,
            pending: HashMap::new(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Box::new(KadSession {
            commands: command_tx,
            query_timeout: self.query_timeout,
            local_peer_id,
            task: Mutex::new(Some(task)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

enum Command {
    Publish {
        key: RecordKey,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Fetch {
        key: RecordKey,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Leave,
}

/// A joined Kademlia directory.
pub struct KadSession {
    commands: mpsc::Sender<Command>,
    query_timeout: Duration,
    local_peer_id: PeerId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KadSession {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, NetworkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        match tokio::time::timeout(self.query_timeout + REPLY_GRACE, reply).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NetworkError::NotRunning),
            Err(_) => Err(NetworkError::Timeout(self.query_timeout)),
        }
    }
}

#[async_trait]
impl DirectorySession for KadSession {
    async fn publish(&self, key: &NetworkKey, value: Vec<u8>) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Publish {
            key: RecordKey::new(&key.as_str()),
            value,
            reply,
        };
        self.request(command, rx).await?
    }

    async fn fetch(&self, key: &NetworkKey) -> Result<Option<Vec<u8>>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Fetch {
            key: RecordKey::new(&key.as_str()),
            reply,
        };
        self.request(command, rx).await
    }

    async fn leave(&self) {
        let _ = self.commands.send(Command::Leave).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("Left DHT as {}", self.local_peer_id);
    }
}

// ---------------------------------------------------------------------------
// Swarm driver
// ---------------------------------------------------------------------------

enum Pending {
    Publish(oneshot::Sender<Result<(), NetworkError>>),
    Fetch {
        reply: oneshot::Sender<Option<Vec<u8>>>,
        /// This node's own copy, returned only if nobody else's turns up.
        own: Option<Vec<u8>>,
    },
}

struct SwarmDriver {
    swarm: Swarm<KadBehaviour>,
    commands: mpsc::Receiver<Command>,
    pending: HashMap<QueryId, Pending>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Leave) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        debug!("DHT driver stopped with {} queries pending", self.pending.len());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Publish { key, value, reply } => {
                let record = Record::new(key, value);
                match self.swarm.behaviour_mut().put_record(record, Quorum::One) {
                    Ok(id) => {
                        self.pending.insert(id, Pending::Publish(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Directory(format!(
                            "Local record store rejected advertisement: {e}"
                        ))));
                    }
                }
            }
            Command::Fetch { key, reply } => {
                let id = self.swarm.behaviour_mut().get_record(key);
                self.pending.insert(id, Pending::Fetch { reply, own: None });
            }
            Command::Leave => {}
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<kad::Event>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("DHT listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("DHT connection to {peer_id}");
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                trace!("DHT connection to {peer_id} closed: {cause:?}");
            }
            SwarmEvent::Behaviour(kad::Event::OutboundQueryProgressed { id, result, .. }) => {
                self.on_query_progress(id, result);
            }
            SwarmEvent::Behaviour(kad::Event::RoutingUpdated { peer, .. }) => {
                debug!("DHT routing table updated with {peer}");
            }
            _ => {}
        }
    }

    fn on_query_progress(&mut self, id: QueryId, result: QueryResult) {
        match result {
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(found))) => {
                let local_peer_id = *self.swarm.local_peer_id();
                if found.record.publisher == Some(local_peer_id) {
                    trace!("DHT lookup found our own record, continuing");
                    if let Some(Pending::Fetch { own, .. }) = self.pending.get_mut(&id) {
                        *own = Some(found.record.value);
                    }
                    return;
                }
                if let Some(Pending::Fetch { reply, .. }) = self.pending.remove(&id) {
                    let _ = reply.send(Some(found.record.value));
                }
                // First foreign record wins.
                if let Some(mut query) = self.swarm.behaviour_mut().query_mut(&id) {
                    query.finish();
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord { .. })) => {
                self.finish_fetch(id);
            }
            QueryResult::GetRecord(Err(e)) => {
                debug!("DHT lookup finished without a foreign record: {e}");
                self.finish_fetch(id);
            }
            QueryResult::PutRecord(result) => {
                if let Err(e) = result {
                    // The record is already in the local store.
                    debug!("DHT replication incomplete: {e}");
                }
                if let Some(Pending::Publish(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(()));
                }
            }
            QueryResult::Bootstrap(Ok(ok)) => {
                trace!("DHT bootstrap step, {} peers remaining", ok.num_remaining);
            }
            QueryResult::Bootstrap(Err(e)) => warn!("DHT bootstrap failed: {e}"),
            other => trace!("Unhandled DHT query result: {other:?}"),
        }
    }

    /// Answer a finished lookup with our own copy, if we saw one.
    fn finish_fetch(&mut self, id: QueryId) {
        if let Some(Pending::Fetch { reply, own }) = self.pending.remove(&id) {
            let _ = reply.send(own);
        }
    }
}
