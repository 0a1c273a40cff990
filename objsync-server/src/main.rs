//! ObjSync Server - Real-Time Object Synchronization
//!
//! Keeps one shared JSON object state consistent across any number of
//! concurrently connected WebSocket clients, with per-object write
//! ordering enforced by a compare-and-swap gate on the persisted record.

use anyhow::Result;
use clap::{Parser, Subcommand};
use objsync_core::{
    ConnectionStore, MemoryConnectionStore, MemoryStateStore, PersistentStore, StateStore,
    PROTOCOL_VERSION,
};
use objsync_server::{DispatchService, ServerConfig, SocketRegistry, SyncServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ObjSync Server Configuration
#[derive(Parser, Debug)]
#[command(name = "objsync-server")]
#[command(author = "ObjSync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Real-time object synchronization server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:9100)
        #[arg(short, long)]
        addr: Option<String>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for the persistent store
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Use the in-memory store (state is lost on exit)
        #[arg(long)]
        memory: bool,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            config,
            data_dir,
            memory,
            debug,
        } => {
            let mut cfg = match &config {
                Some(path) => ServerConfig::load(path)?,
                None => ServerConfig::default(),
            };
            if let Some(addr) = addr {
                cfg.addr = addr;
            }
            if let Some(data_dir) = data_dir {
                cfg.data_dir = data_dir;
            }
            cfg.memory |= memory;
            cfg.debug |= debug;

            // Initialize tracing
            let env_filter = if cfg.debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            info!("Starting ObjSync server on {}", cfg.addr);
            info!("Protocol version {}", PROTOCOL_VERSION);

            let registry = SocketRegistry::new();
            let (states, connections, persistent): (
                Arc<dyn StateStore>,
                Arc<dyn ConnectionStore>,
                Option<Arc<PersistentStore>>,
            ) = if cfg.memory {
                info!("Using in-memory store");
                (
                    Arc::new(MemoryStateStore::new()),
                    Arc::new(MemoryConnectionStore::new()),
                    None,
                )
            } else {
                info!("Opening persistent store at {}", cfg.data_dir);
                let store = Arc::new(PersistentStore::open(Path::new(&cfg.data_dir))?);
                (store.clone(), store.clone(), Some(store))
            };

            let dispatch = Arc::new(
                DispatchService::new(states, connections, registry.clone())
                    .with_replay_window(cfg.replay_window),
            );
            let server = SyncServer::new(dispatch, registry);

            let listener = TcpListener::bind(&cfg.addr).await?;
            info!("Server listening on {}", cfg.addr);
            info!("Ready to accept sync connections");

            tokio::select! {
                result = server.run(listener) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }

            if let Some(store) = persistent {
                store.persist()?;
            }
        }
    }

    Ok(())
}
