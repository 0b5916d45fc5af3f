//! Peer directory, the rendezvous store advertisements are published to.
//!
//! The directory is a best-effort bulletin board: one value per key, last
//! writer wins, and a failed or empty read simply means "try again next
//! cycle". Two backends are provided:
//!
//! - [`MemoryDirectory`]: a process-local board, used by tests and by
//!   `nexus run --memory-directory`.
//! - [`KadDirectory`]: a libp2p Kademlia DHT session.

mod kad;
mod memory;

pub use kad::{KadDirectory, KadSession};
pub use memory::{MemoryDirectory, MemorySession};

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::network_key::NetworkKey;

/// Something a node can join to read and write advertisements.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Start participating, binding `listen_port`. Failures are reported,
    /// never retried internally.
    async fn join(&self, listen_port: u16) -> Result<Box<dyn DirectorySession>, NetworkError>;
}

/// A joined directory.
#[async_trait]
pub trait DirectorySession: Send + Sync {
    /// Store `value` under `key`, replacing whatever was there.
    async fn publish(&self, key: &NetworkKey, value: Vec<u8>) -> Result<(), NetworkError>;

    /// Read the last value published under `key`, if any could be found.
    async fn fetch(&self, key: &NetworkKey) -> Result<Option<Vec<u8>>, NetworkError>;

    /// Stop participating. Later calls fail with [`NetworkError::NotRunning`].
    async fn leave(&self);
}
