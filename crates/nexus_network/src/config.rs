//! Network configuration for a Nexus node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the discovery subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Namespace (usually a release tag) the network key is derived from.
    /// Nodes only see each other when this string is byte-identical.
    pub namespace: String,

    /// TCP port the DHT session listens on.
    pub dht_port: u16,

    /// UDP port the liveness responder listens on. Also the port we advertise.
    pub ping_port: u16,

    /// How long a liveness probe waits for any reply.
    #[serde(with = "duration_ms_serde")]
    pub probe_timeout: Duration,

    /// Wait between completed discovery cycles.
    #[serde(with = "duration_serde")]
    pub cycle_interval: Duration,

    /// Wait after a cycle that found nothing published yet.
    #[serde(with = "duration_serde")]
    pub idle_retry_interval: Duration,

    /// Wait after a cycle failed unexpectedly.
    #[serde(with = "duration_serde")]
    pub error_backoff: Duration,

    /// Upper bound for a single DHT query.
    #[serde(with = "duration_serde")]
    pub dht_query_timeout: Duration,

    /// Allow a seen address to be probed again after this long.
    /// `None` probes every address at most once per process lifetime.
    #[serde(with = "option_duration_serde")]
    pub reprobe_after: Option<Duration>,

    /// Peers confirmed within this window count as active in status snapshots.
    #[serde(with = "duration_serde")]
    pub active_window: Duration,

    /// Public address used to find the outbound interface. Nothing is sent to it.
    pub route_probe_target: SocketAddr,

    /// DHT bootstrap peers as multiaddrs ending in `/p2p/<peer id>`.
    pub dht_bootstrap: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            namespace: format!("v{}", env!("CARGO_PKG_VERSION")),
            dht_port: 8468,
            ping_port: 42101,
            probe_timeout: Duration::from_millis(100),
            cycle_interval: Duration::from_secs(15),
            idle_retry_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(10),
            dht_query_timeout: Duration::from_secs(10),
            reprobe_after: None,
            active_window: Duration::from_secs(60 * 60),
            route_probe_target: SocketAddr::from(([8, 8, 8, 8], 80)),
            dht_bootstrap: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
