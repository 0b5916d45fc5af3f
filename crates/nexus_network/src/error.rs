//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the nexus_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The peer directory (DHT) could not complete an operation.
    #[error("Directory error: {0}")]
    Directory(String),

    /// A local socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node or directory session is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
