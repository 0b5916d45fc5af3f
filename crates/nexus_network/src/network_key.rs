//! Network key: the DHT lookup key that scopes one discovery swarm.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix hashed in front of the namespace. Changing it partitions every swarm.
pub const NETWORK_KEY_PREFIX: &str = "atsuko-nexus-p2p-";

/// Hex-encoded SHA-256 of [`NETWORK_KEY_PREFIX`] followed by a namespace string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkKey(String);

impl NetworkKey {
    /// Derive the key for `namespace`. Nodes interoperate only when their
    /// namespace strings are byte-identical.
    pub fn derive(namespace: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NETWORK_KEY_PREFIX.as_bytes());
        hasher.update(namespace.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// First 12 hex characters, for log lines. Shorter values come back whole.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-function form of [`NetworkKey::derive`].
pub fn derive_network_key(namespace: &str) -> NetworkKey {
    NetworkKey::derive(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            derive_network_key("v1").as_str(),
            "3b996417132e41a8103918295316250770bf949bcd838628b86b5ea47a6fbbb2"
        );
        assert_eq!(
            derive_network_key("").as_str(),
            "25de8bcb59f31eecc0460cc8d25d34847f38aad243d08be273a20a027104e168"
        );
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(derive_network_key("v1.3.1"), derive_network_key("v1.3.1"));
    }

    #[test]
    fn test_namespaces_partition() {
        assert_ne!(derive_network_key("v1"), derive_network_key("v2"));
        // Namespaces are compared byte for byte.
        assert_ne!(derive_network_key("v1"), derive_network_key("v1 "));
        assert_ne!(derive_network_key("v1"), derive_network_key("V1"));
    }

    #[test]
    fn test_key_shape() {
        let key = derive_network_key("TEST");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key.short(), &key.as_str()[..12]);
    }

    #[test]
    fn test_short_tolerates_short_values() {
        let key: NetworkKey = serde_json::from_str(r#""beef""#).unwrap();
        assert_eq!(key.short(), "beef");
    }
}
