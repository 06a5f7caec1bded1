//! supercompose worker daemon
//!
//! Keeps SSH sessions to every enabled node and reconciles their docker
//! compose deployments on a schedule and on demand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sc_core::config::{self, WorkerConfig};
use sc_core::model::{ConnectTarget, NodeCredentials};
use sc_core::traits::{LockBackend, NodeEvents, Store};
use sc_core::NodeId;
use sc_envelope::SecretCodec;
use sc_worker::events::{MemoryNodeEvents, RedisNodeEvents};
use sc_worker::lock::{MemoryLockBackend, RedisLockBackend};
use sc_worker::remote::{test_connection, SshConnector};
use sc_worker::{
    DispatchOptions, Dispatcher, LockCoordinator, LockOptions, MemoryStore, Reconciler,
    SessionPool,
};

#[derive(Parser)]
#[command(name = "sc-worker")]
#[command(about = "supercompose worker - reconciles docker compose deployments over SSH")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long, global = true)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker (default)
    Run {
        /// Inventory file (overrides config)
        #[arg(short, long)]
        inventory: Option<PathBuf>,

        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },

    /// Check that a host accepts the given credentials
    TestConnection {
        /// Host name or IP address
        #[arg(long)]
        host: String,

        /// SSH port
        #[arg(short, long, default_value_t = 22)]
        port: u16,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Seal node credentials for the inventory file
    EncryptCredentials {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Write a configuration file with default settings
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Announce a node change to running workers
    Notify {
        /// Node to reconcile
        #[arg(long)]
        node: NodeId,
    },
}

#[derive(clap::Args)]
struct CredentialArgs {
    /// Login user
    #[arg(short, long)]
    username: String,

    /// Login password
    #[arg(long, env = "SC_NODE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file (OpenSSH or PEM)
    #[arg(long)]
    private_key: Option<PathBuf>,
}

impl CredentialArgs {
    fn load(&self) -> Result<NodeCredentials> {
        let private_key = match &self.private_key {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read private key {:?}", path))?,
            ),
            None => None,
        };
        if self.password.is_none() && private_key.is_none() {
            bail!("Either --password or --private-key is required");
        }
        Ok(NodeCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            private_key,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args.config;

    match args.command.unwrap_or(Command::Run {
        inventory: None,
        once: false,
    }) {
        Command::Run { inventory, once } => {
            run(load_config(config_path.as_ref())?, inventory, once).await
        }
        Command::TestConnection {
            host,
            port,
            credentials,
        } => {
            let target = ConnectTarget {
                host,
                port,
                credentials: credentials.load()?,
            };
            match test_connection(&target).await {
                Ok(()) => {
                    println!("Connected to {}", target.display_address());
                    Ok(())
                }
                Err(e) => bail!("{} ({})", e, e.kind.hint()),
            }
        }
        Command::EncryptCredentials { credentials } => {
            let codec = master_codec(&load_config(config_path.as_ref())?)?;
            let sealed = codec.encrypt(&credentials.load()?.to_bytes()?)?;
            println!("{}", hex::encode(sealed));
            Ok(())
        }
        Command::Notify { node } => {
            let config = load_config(config_path.as_ref())?;
            let Some(url) = &config.redis_url else {
                bail!("redis_url is not configured, no running worker can be notified");
            };
            RedisNodeEvents::connect(url).await?.publish(node).await?;
            tracing::info!("Published update for node {}", node);
            Ok(())
        }
        Command::InitConfig { force } => init_config(config_path.as_ref(), force),
    }
}

fn init_config(path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = path.cloned().unwrap_or_else(config::default_config_path);
    if path.exists() && !force {
        bail!("{:?} already exists, pass --force to overwrite it", path);
    }
    config::save_config(&path, &WorkerConfig::default())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<WorkerConfig> {
    let config = if let Some(config_path) = path {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                WorkerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            WorkerConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

fn master_codec(config: &WorkerConfig) -> Result<SecretCodec> {
    let key = std::env::var(&config.master_key_env)
        .with_context(|| format!("Master key variable {} not set", config.master_key_env))?;
    if key.is_empty() {
        bail!("Master key variable {} is empty", config.master_key_env);
    }
    Ok(SecretCodec::new(key))
}

async fn run(config: WorkerConfig, inventory: Option<PathBuf>, once: bool) -> Result<()> {
    tracing::info!("supercompose worker starting...");

    let codec = master_codec(&config)?;
    let inventory_path = inventory.unwrap_or_else(|| config.inventory_path.clone());
    let store: Arc<dyn Store> = Arc::new(
        MemoryStore::load(&inventory_path)
            .with_context(|| format!("Failed to load inventory from {:?}", inventory_path))?,
    );

    let (locks, events): (Arc<dyn LockBackend>, Arc<dyn NodeEvents>) = match &config.redis_url {
        Some(url) => {
            tracing::info!("Using Redis at {} for locks and node updates", url);
            (
                Arc::new(RedisLockBackend::connect(url).await?) as Arc<dyn LockBackend>,
                Arc::new(RedisNodeEvents::connect(url).await?) as Arc<dyn NodeEvents>,
            )
        }
        None => {
            tracing::warn!("No redis_url configured - locks and node updates are local to this process");
            (
                Arc::new(MemoryLockBackend::new()) as Arc<dyn LockBackend>,
                Arc::new(MemoryNodeEvents::new()) as Arc<dyn NodeEvents>,
            )
        }
    };

    let connector = Arc::new(SshConnector::new(config.connect_timeout, config.command_timeout));
    let pool = Arc::new(SessionPool::new(
        connector,
        codec,
        Arc::clone(&store),
        config.backoff.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        pool.clone(),
        Arc::clone(&store),
        config.compose_command.clone(),
        config.check_interval,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        reconciler,
        LockCoordinator::new(locks),
        events,
        DispatchOptions {
            sweep_interval: config.sweep_interval,
            resubscribe_delay: config.resubscribe_delay,
            lock: LockOptions::from(&config.lock),
        },
    ));

    pool.start().await?;

    if once {
        let outcomes = dispatcher.sweep().await;
        for (node_id, outcome) in &outcomes {
            tracing::info!("Node {}: {}", node_id, outcome.label());
        }
        pool.shutdown().await;
        return Ok(());
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    dispatcher.run(cancel).await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supercompose").join("worker.toml");

        init_config(Some(&path), false).unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.compose_command, WorkerConfig::default().compose_command);

        // Existing files are kept unless forced
        assert!(init_config(Some(&path), false).is_err());
        init_config(Some(&path), true).unwrap();
    }
}
