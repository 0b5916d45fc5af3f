//! Nexus Network: rendezvous-based peer discovery.
//!
//! Nodes that share a namespace derive the same [`NetworkKey`], publish a
//! one-element advertisement of themselves under it in a DHT, read back
//! whatever is there and confirm each new address with a UDP `PING`/`PONG`.
//!
//! # Architecture
//!
//! - **Identity**: a machine fingerprint hashed into a [`NodeId`].
//! - **Directory**: a best-effort key/value bulletin board, either libp2p
//!   Kademlia or an in-process board for tests.
//! - **Probe**: one `PING` per new address, any reply within the window
//!   counts as alive.
//! - **Discovery**: the cycle loop tying these together, with a fixed
//!   backoff on failure.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use nexus_network::{NetworkConfig, NexusNode};
//!
//! # async fn example() {
//! let mut node = NexusNode::with_defaults(NetworkConfig::default());
//!
//! node.start().await.unwrap();
//! // ... node is advertising itself and probing peers ...
//! node.stop().await;
//! # }
//! ```

pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod local_addr;
pub mod network_key;
pub mod node;
pub mod peer;
pub mod platform;
pub mod probe;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use directory::{DirectorySession, KadDirectory, MemoryDirectory, PeerDirectory};
pub use discovery::{CycleOutcome, DiscoveryLoop, DiscoveryPhase, DiscoveryStatus};
pub use error::NetworkError;
pub use identity::{NodeId, NodeIdentity, get_node_id};
pub use local_addr::LocalAddress;
pub use network_key::{NetworkKey, derive_network_key};
pub use node::NexusNode;
pub use peer::{KnownPeer, PeerAdvertisement, PeerRecord, PeerRegistry, PeerState, SeenPeers};
pub use platform::Platform;
pub use probe::{Prober, Responder, UdpProber};
