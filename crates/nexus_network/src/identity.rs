//! Node identity: a stable machine fingerprint hashed into a 256-bit ID.
//!
//! The fingerprint is built from an ordered list of [`FingerprintSource`]s.
//! Sources that cannot be read contribute nothing; the remaining fragments
//! are joined with `|` and hashed with SHA-256. When every source fails, a
//! fixed sentinel is hashed instead and the identity is flagged as
//! degraded, because two such machines end up with the same ID.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::platform::Platform;

/// Fingerprint hashed when no source produced anything.
pub const FALLBACK_FINGERPRINT: &str = "unknown-os";

/// Hex-encoded SHA-256 digest identifying this machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Hash an already-joined fingerprint.
    pub fn from_fingerprint(fingerprint: &str) -> Self {
        Self(hex::encode(Sha256::digest(fingerprint.as_bytes())))
    }

    /// Return the inner hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines. Shorter values come back whole.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint sources
// ---------------------------------------------------------------------------

/// One hardware/OS identifier that may or may not be available.
pub trait FingerprintSource: Send + Sync {
    /// Short description used in diagnostics.
    fn label(&self) -> &str;

    /// Read the fragment. `None` (or an empty string) means "contributes nothing".
    fn read(&self) -> Option<String>;
}

/// Reads a file and trims surrounding whitespace.
pub struct FileSource {
    path: PathBuf,
    label: String,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self { path, label }
    }
}

impl FingerprintSource for FileSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(e) => {
                debug!("Failed to read {}: {e}", self.label);
                None
            }
        }
    }
}

/// Runs a command and keeps the last non-empty line of its stdout.
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    strip_quotes: bool,
    label: String,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        let program = program.into();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let label = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            program,
            args,
            strip_quotes: false,
            label,
        }
    }

    /// Remove surrounding double quotes from the extracted line.
    pub fn strip_quotes(mut self) -> Self {
        self.strip_quotes = true;
        self
    }
}

impl FingerprintSource for CommandSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&self) -> Option<String> {
        let output = match Command::new(&self.program)
            .args(&self.args)
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!("Failed to run {}: {e}", self.label);
                return None;
            }
        };

        if !output.status.success() {
            debug!("{} exited with {}", self.label, output.status);
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()?;
        let line = if self.strip_quotes {
            line.trim_matches('"')
        } else {
            line
        };
        Some(line.to_string())
    }
}

/// The ordered fingerprint sources used on `platform`.
pub fn default_sources(platform: Platform) -> Vec<Box<dyn FingerprintSource>> {
    match platform {
        Platform::Linux => vec![
            Box::new(FileSource::new("/etc/machine-id")),
            Box::new(FileSource::new("/var/lib/dbus/machine-id")),
            Box::new(FileSource::new("/sys/class/dmi/id/product_uuid")),
        ],
        Platform::Windows => vec![
            Box::new(CommandSource::new("wmic", &["csproduct", "get", "uuid"])),
            Box::new(CommandSource::new(
                "powershell",
                &[
                    "-command",
                    "Get-WmiObject Win32_ComputerSystemProduct | Select-Object -ExpandProperty UUID",
                ],
            )),
        ],
        Platform::MacOs => vec![Box::new(
            CommandSource::new(
                "sh",
                &[
                    "-c",
                    "ioreg -rd1 -c IOPlatformExpertDevice | awk '/IOPlatformUUID/ { print $3; }'",
                ],
            )
            .strip_quotes(),
        )],
        Platform::Unsupported => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// The local node's identity, computed once per process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// The hashed fingerprint.
    pub node_id: NodeId,
    /// How many sources contributed a fragment.
    pub fragments: usize,
    /// True when no source was readable and the fallback sentinel was hashed.
    pub degraded: bool,
}

impl NodeIdentity {
    /// Compute the identity from the default sources for `platform`.
    pub fn for_platform(platform: Platform) -> Self {
        debug!("Collecting node fingerprint on {platform}");
        Self::from_sources(&default_sources(platform))
    }

    /// Compute the identity for the current host.
    pub fn detect() -> Self {
        Self::for_platform(Platform::current())
    }

    /// Compute the identity from an explicit, ordered set of sources.
    pub fn from_sources(sources: &[Box<dyn FingerprintSource>]) -> Self {
        let parts: Vec<String> = sources
            .iter()
            .filter_map(|source| {
                let fragment = source.read().filter(|f| !f.trim().is_empty());
                debug!(
                    source = source.label(),
                    found = fragment.is_some(),
                    "Fingerprint source"
                );
                fragment
            })
            .collect();

        let degraded = parts.is_empty();
        let fingerprint = if degraded {
            warn!(
                "No fingerprint source was readable; node ID falls back to a shared sentinel \
                 and may collide with other machines"
            );
            FALLBACK_FINGERPRINT.to_string()
        } else {
            parts.join("|")
        };

        Self {
            node_id: NodeId::from_fingerprint(&fingerprint),
            fragments: parts.len(),
            degraded,
        }
    }
}

/// The node ID of this machine. Never fails; see [`NodeIdentity::degraded`].
pub fn get_node_id() -> NodeId {
    NodeIdentity::detect().node_id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
