use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{DirectorySession, PeerDirectory};
use crate::error::NetworkError;
use crate::network_key::NetworkKey;

type Board = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// A process-local directory. Clones share the same board, so several
/// nodes in one process can discover each other through it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    board: Board,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value under `key`, bypassing any session.
    pub fn get(&self, key: &NetworkKey) -> Option<Vec<u8>> {
        self.board.lock().get(key.as_str()).cloned()
    }

    /// Overwrite `key` directly, e.g. to plant a foreign advertisement.
    pub fn put(&self, key: &NetworkKey, value: impl Into<Vec<u8>>) {
        self.board.lock().insert(key.as_str().to_string(), value.into());
    }

    pub fn len(&self) -> usize {
        self.board.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.board.lock().is_empty()
    }
}

#[async_trait]
impl PeerDirectory for MemoryDirectory {
    async fn join(&self, listen_port: u16) -> Result<Box<dyn DirectorySession>, NetworkError> {
        debug!("Joined in-memory directory (port {listen_port} unused)");
        Ok(Box::new(MemorySession {
            board: Arc::clone(&self.board),
            left: AtomicBool::new(false),
        }))
    }
}

/// Session handed out by [`MemoryDirectory::join`].
#[derive(Debug)]
pub struct MemorySession {
    board: Board,
    left: AtomicBool,
}

impl MemorySession {
    fn ensure_joined(&self) -> Result<(), NetworkError> {
        if self.left.load(Ordering::Acquire) {
            return Err(NetworkError::NotRunning);
        }
        Ok(())
    }
}

#[async_trait]
impl DirectorySession for MemorySession {
    async fn publish(&self, key: &NetworkKey, value: Vec<u8>) -> Result<(), NetworkError> {
        self.ensure_joined()?;
        self.board.lock().insert(key.as_str().to_string(), value);
        Ok(())
    }

    async fn fetch(&self, key: &NetworkKey) -> Result<Option<Vec<u8>>, NetworkError> {
        self.ensure_joined()?;
        Ok(self.board.lock().get(key.as_str()).cloned())
    }

    async fn leave(&self) {
        self.left.store(true, Ordering::Release);
    }
}
