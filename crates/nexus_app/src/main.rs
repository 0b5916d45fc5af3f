use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use nexus_core::{logging, paths, shutdown};
use nexus_network::{
    DiscoveryPhase, KadDirectory, MemoryDirectory, NetworkConfig, NexusNode, NodeIdentity,
    PeerDirectory, derive_network_key,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "nexus", version)]
#[command(about = "Serverless peer discovery over a DHT rendezvous key")]
struct Cli {
    /// Config file (defaults to ~/.nexus/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `nexus_network=trace` (RUST_LOG wins)
    #[arg(long, global = true, default_value = logging::DEFAULT_FILTER)]
    log_level: String,

    /// Log to the console only
    #[arg(long, global = true)]
    no_log_file: bool,

    /// Flags for the default `run`, so env vars apply without a subcommand.
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a discovery node until interrupted (default)
    Run(RunArgs),
    /// Print this machine's node ID
    NodeId,
    /// Print the network key for a namespace
    NetworkKey {
        namespace: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Namespace the network key is derived from
    #[arg(long, env = "NEXUS_NAMESPACE")]
    namespace: Option<String>,

    /// TCP port for the DHT
    #[arg(long, env = "NEXUS_DHT_PORT")]
    dht_port: Option<u16>,

    /// UDP port for liveness probes
    #[arg(long, env = "NEXUS_PING_PORT")]
    ping_port: Option<u16>,

    /// DHT bootstrap peer, `/ip4/<ip>/tcp/<port>/p2p/<peer id>` (repeatable)
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Use an in-process directory instead of the DHT
    #[arg(long)]
    memory_directory: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut NetworkConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(port) = self.dht_port {
            config.dht_port = port;
        }
        if let Some(port) = self.ping_port {
            config.ping_port = port;
        }
        config.dht_bootstrap.extend(self.bootstrap.iter().cloned());
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::NodeId) => {
            logging::init_console_logging("warn")?;
            print_node_id();
            Ok(())
        }
        Some(Command::NetworkKey { namespace }) => {
            println!("{}", derive_network_key(namespace));
            Ok(())
        }
        Some(Command::Run(args)) => run(&cli, args).await,
        None => run(&cli, &cli.run).await,
    }
}

fn print_node_id() {
    let identity = NodeIdentity::detect();
    println!("{}", identity.node_id);
    println!("fragments: {}, degraded: {}", identity.fragments, identity.degraded);
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let _log_guard = if cli.no_log_file {
        logging::init_console_logging(&cli.log_level)?;
        None
    } else {
        paths::ensure_dirs()?;
        let logs_dir = paths::logs_dir()?;
        Some(logging::init_logging(&logs_dir, &cli.log_level, true)?)
    };
    info!("Starting Nexus v{VERSION}");

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = NetworkConfig::load_or_default(&config_path);
    args.apply(&mut config);
    info!("Config loaded from {}", config_path.display());

    let directory: Arc<dyn PeerDirectory> = if args.memory_directory {
        warn!("Using the in-process directory; only nodes in this process are visible");
        Arc::new(MemoryDirectory::new())
    } else {
        Arc::new(KadDirectory::from_config(&config))
    };

    let mut node = NexusNode::new(NodeIdentity::detect(), config, directory);
    node.start().await.context("Failed to start node")?;

    let mut status = node
        .subscribe_status()
        .context("Node started without a status channel")?;
    let mut reported_cycles = 0;
    let signal = shutdown::wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.phase == DiscoveryPhase::Idle && snapshot.cycles != reported_cycles {
                    reported_cycles = snapshot.cycles;
                    info!(
                        "Cycle {}: {} seen, {} alive, {} active",
                        snapshot.cycles, snapshot.seen, snapshot.alive, snapshot.active
                    );
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}
