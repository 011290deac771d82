//! Command-line entry point: bring up an overlay node, or manage its
//! identity and peer registry without starting the network.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use overlay_node::capabilities::{InMemoryMinerManager, InMemoryProfileManager};
use overlay_node::identity::{IdentityError, Role};
use overlay_node::registry::Peer;
use overlay_node::{Controller, Dispatcher, NodeConfig, NodeError, NodeManager, PeerRegistry, Transport, Worker};
use tracing::{error, info, warn};

/// Usage error: bad arguments, unparsable flags.
const EXIT_USAGE: u8 = 2;
/// Runtime error: everything else that isn't one of the more specific codes.
const EXIT_RUNTIME: u8 = 3;
/// Identity not initialized: `node identity generate` was never run.
const EXIT_NOT_INITIALIZED: u8 = 4;
/// Peer not found: `peer remove`/`peer ping` named an unknown id.
const EXIT_PEER_NOT_FOUND: u8 = 5;

#[derive(Parser)]
#[command(name = "overlay-node", version, about = "Peer-to-peer overlay node for a mining fleet")]
struct Cli {
    /// Path to a TOML config file layered over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Directory holding this node's persisted state (identity, peers).
    #[arg(long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: accept inbound connections and serve requests.
    Serve {
        /// Override the configured listen address, e.g. 0.0.0.0:9091.
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
    },
    /// Manage known peers.
    Peer {
        #[command(subcommand)]
        command: PeerCommand,
    },
    /// Manage this node's identity.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
}

#[derive(Subcommand)]
enum PeerCommand {
    /// Register a new peer.
    Add {
        id: String,
        name: String,
        public_key: String,
        address: String,
        #[arg(long, value_enum, default_value = "worker")]
        role: RoleArg,
    },
    /// Forget a peer.
    Remove { id: String },
    /// List known peers.
    List,
    /// Round-trip a ping against a peer, dialing it if not already connected.
    Ping { id: String },
}

#[derive(Subcommand)]
enum NodeCommand {
    #[command(subcommand)]
    Identity(IdentityCommand),
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Generate a fresh identity, overwriting any existing one.
    Generate {
        name: String,
        #[arg(long, value_enum, default_value = "dual")]
        role: RoleArg,
    },
    /// Print the current identity.
    Show,
    /// Delete the current identity.
    Delete,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RoleArg {
    Controller,
    Worker,
    Dual,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Controller => Role::Controller,
            RoleArg::Worker => Role::Worker,
            RoleArg::Dual => Role::Dual,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("overlay_node=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match NodeConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Peer { command } => peer_command(config, command).await,
        Command::Node { command: NodeCommand::Identity(command) } => identity_command(config, command),
    }
}

fn open_manager(config: &NodeConfig) -> Result<NodeManager, ExitCode> {
    NodeManager::load(config.private_key_path(), config.identity_path()).map_err(|e| match e {
        IdentityError::NotInitialized => {
            error!("identity not initialized; run `overlay-node node identity generate <name>` first");
            ExitCode::from(EXIT_NOT_INITIALIZED)
        }
        e => {
            error!("failed to load identity: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    })
}

fn open_registry(config: &NodeConfig) -> Result<Arc<PeerRegistry>, ExitCode> {
    PeerRegistry::open(config.peers_path()).map_err(|e| {
        error!("failed to open peer registry: {e}");
        ExitCode::from(EXIT_RUNTIME)
    })
}

async fn serve(mut config: NodeConfig, listen: Option<std::net::SocketAddr>) -> ExitCode {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let manager = match open_manager(&config) {
        Ok(m) => Arc::new(m),
        Err(code) => return code,
    };
    let registry = match open_registry(&config) {
        Ok(r) => r,
        Err(code) => return code,
    };

    let (transport, inbound_rx) = Transport::new(manager.clone(), registry.clone(), config.transport_config());
    let controller = Controller::new(manager.clone(), registry.clone(), transport.clone());

    // Stand-ins for the out-of-scope miner supervisor and profile store
    // (§1 Non-goals) so a node can be brought up and driven end to end.
    let miner_manager: Arc<dyn overlay_node::capabilities::MinerManager> = Arc::new(InMemoryMinerManager::new());
    let profile_manager: Arc<dyn overlay_node::capabilities::ProfileManager> = Arc::new(InMemoryProfileManager::new());
    let worker = Arc::new(Worker::new(manager.clone(), &miner_manager, &profile_manager, config.data_dir.join("miners")));

    Dispatcher::spawn(transport.clone(), controller, worker, inbound_rx);

    info!(node_id = manager.id(), addr = %config.listen_addr, "starting overlay node");

    let serve_transport = transport.clone();
    let serve_handle = tokio::spawn(async move { serve_transport.serve().await });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    transport.stop().await;
    registry.close().await;

    match serve_handle.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("transport exited with error: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
        Err(e) => {
            error!("transport task panicked: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn peer_command(config: NodeConfig, command: PeerCommand) -> ExitCode {
    let registry = match open_registry(&config) {
        Ok(r) => r,
        Err(code) => return code,
    };

    match command {
        PeerCommand::Add { id, name, public_key, address, role } => {
            let peer = Peer::new(id, name, public_key, address, role.into());
            match registry.add_peer(peer).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("failed to add peer: {e}");
                    usage_or_runtime(&e)
                }
            }
        }
        PeerCommand::Remove { id } => match registry.remove_peer(&id).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(NodeError::NotFound(_)) => {
                error!("peer {id} not found");
                ExitCode::from(EXIT_PEER_NOT_FOUND)
            }
            Err(e) => {
                error!("failed to remove peer: {e}");
                ExitCode::from(EXIT_RUNTIME)
            }
        },
        PeerCommand::List => {
            let peers = registry.list().await;
            for peer in &peers {
                println!(
                    "{}\t{}\t{}\tscore={:.1}\tconnected={}",
                    peer.id, peer.name, peer.address, peer.score, peer.connected
                );
            }
            ExitCode::SUCCESS
        }
        PeerCommand::Ping { id } => {
            let manager = match open_manager(&config) {
                Ok(m) => Arc::new(m),
                Err(code) => return code,
            };
            let (transport, mut inbound_rx) = Transport::new(manager.clone(), registry.clone(), config.transport_config());
            let controller = Controller::new(manager, registry.clone(), transport.clone());

            // A one-shot CLI call never serves requests of its own, but
            // pings still arrive as replies through this same channel.
            let reply_controller = controller.clone();
            tokio::spawn(async move {
                while let Some(overlay_node::transport::Inbound { message, .. }) = inbound_rx.recv().await {
                    if message.is_reply() {
                        reply_controller.deliver_reply(message).await;
                    }
                }
            });

            match controller.ping_peer(&id).await {
                Ok(rtt) => {
                    println!("pong from {id} in {:.1}ms", rtt.as_secs_f64() * 1000.0);
                    ExitCode::SUCCESS
                }
                Err(NodeError::NotFound(_)) => {
                    error!("peer {id} not found");
                    ExitCode::from(EXIT_PEER_NOT_FOUND)
                }
                Err(e) => {
                    error!("ping failed: {e}");
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }
    }
}

fn identity_command(config: NodeConfig, command: IdentityCommand) -> ExitCode {
    match command {
        IdentityCommand::Generate { name, role } => {
            match NodeManager::generate(&name, role.into(), config.private_key_path(), config.identity_path()) {
                Ok(manager) => {
                    println!("node id: {}", manager.id());
                    println!("public key: {}", manager.public_key_base64());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("failed to generate identity: {e}");
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }
        IdentityCommand::Show => match NodeManager::load(config.private_key_path(), config.identity_path()) {
            Ok(manager) => {
                let record = manager.record();
                println!("id: {}", record.id);
                println!("name: {}", record.name);
                println!("role: {:?}", record.role);
                println!("public key: {}", record.public_key);
                ExitCode::SUCCESS
            }
            Err(IdentityError::NotInitialized) => {
                error!("identity not initialized");
                ExitCode::from(EXIT_NOT_INITIALIZED)
            }
            Err(e) => {
                error!("failed to load identity: {e}");
                ExitCode::from(EXIT_RUNTIME)
            }
        },
        IdentityCommand::Delete => match NodeManager::delete(config.private_key_path(), config.identity_path()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("failed to delete identity: {e}");
                ExitCode::from(EXIT_RUNTIME)
            }
        },
    }
}

fn usage_or_runtime(e: &NodeError) -> ExitCode {
    match e {
        NodeError::InvalidKey(_) | NodeError::InvalidName(_) => {
            warn!("rejected: {e}");
            ExitCode::from(EXIT_USAGE)
        }
        _ => ExitCode::from(EXIT_RUNTIME),
    }
}
