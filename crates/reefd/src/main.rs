//! `reefd`: the Reef daemon.
//!
//! Runs tracker or storage nodes, and doubles as an operator client.
//!
//! # Usage
//!
//! ```text
//! reefd tracker                                   # start a tracker
//! reefd tracker -c reef.toml                      # start with a config file
//! reefd storage -d ./node2 -l 0.0.0.0:23001 --tracker 10.0.0.1:22122
//! reefd upload photo.jpg --storage 10.0.0.5:23000
//! reefd download 0D/3C/0d3c...ed2.jpg out.jpg --storage 10.0.0.5:23000
//! reefd query 0d3cc782c3242cf3ce4b2174e1041ed2 --storage 10.0.0.5:23000
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reef_meta::MetaStore;
use reef_net::ConnectionPool;
use reef_node::{Client, StorageHandle, StorageNode, TrackerNode};
use reef_types::ServerEndpoint;
use tokio::net::TcpListener;
use tracing::info;

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "reefd",
    version,
    about = "Reef distributed content-addressable file storage daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cluster secret (nodes and clients must share the same secret).
    ///
    /// Can also be set via REEF_SECRET env var or `[cluster] secret` in the
    /// config file.
    #[arg(long, env = "REEF_SECRET", global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tracker node.
    Tracker {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override listen address (e.g. "0.0.0.0:22122").
        #[arg(short, long)]
        listen_addr: Option<String>,
    },

    /// Run a storage node.
    Storage {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override listen address (e.g. "0.0.0.0:23000").
        #[arg(short, long)]
        listen_addr: Option<String>,

        /// Tracker to register with, as `host:port`. Can be specified
        /// multiple times.
        #[arg(short, long)]
        tracker: Vec<String>,

        /// Override replication group.
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Upload a file to a storage node and print its path.
    Upload {
        /// File to upload.
        file: PathBuf,

        /// Storage node as `host:port`.
        #[arg(short, long)]
        storage: String,

        /// Extension appended to the stored path (defaults to the file's).
        #[arg(short, long)]
        ext: Option<String>,
    },

    /// Download a stored file.
    Download {
        /// Stored path or bare digest.
        path: String,

        /// Where to write the content.
        out: PathBuf,

        /// Storage node as `host:port`.
        #[arg(short, long)]
        storage: String,
    },

    /// Check whether a storage node holds a file.
    Query {
        /// Stored path or bare digest.
        path_or_md5: String,

        /// Storage node as `host:port`.
        #[arg(short, long)]
        storage: String,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    if let Some(secret) = cli.secret {
        config.cluster.secret = secret;
    }

    match cli.command {
        Commands::Tracker {
            data_dir,
            listen_addr,
        } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(addr) = listen_addr {
                config.tracker.listen_addr = addr;
            }
            cmd_tracker(config).await
        }
        Commands::Storage {
            data_dir,
            listen_addr,
            tracker,
            group,
        } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(addr) = listen_addr {
                config.storage.listen_addr = addr;
            }
            if !tracker.is_empty() {
                config.storage.trackers = tracker;
            }
            if let Some(group) = group {
                config.storage.group = group;
            }
            cmd_storage(config).await
        }
        Commands::Upload { file, storage, ext } => cmd_upload(&config, file, &storage, ext).await,
        Commands::Download { path, out, storage } => {
            cmd_download(&config, &path, out, &storage).await
        }
        Commands::Query {
            path_or_md5,
            storage,
        } => cmd_query(&config, &path_or_md5, &storage).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// reefd tracker / reefd storage
// -----------------------------------------------------------------------

async fn cmd_tracker(mut config: CliConfig) -> Result<()> {
    info!("starting reefd tracker");

    if config.cluster.secret.is_empty() {
        config.cluster.secret = generate_secret();
        info!("cluster secret (generated): {}", config.cluster.secret);
    }

    std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
        format!(
            "failed to create data dir {}",
            config.node.data_dir.display()
        )
    })?;
    let meta = Arc::new(
        MetaStore::open(config.node.data_dir.join("meta"))
            .context("failed to open metadata store")?,
    );

    let listener = TcpListener::bind(&config.tracker.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.tracker.listen_addr))?;
    let tracker = TrackerNode::start(config.tracker_config(), listener, meta)
        .context("failed to start tracker")?;

    info!(
        "to join this tracker: reefd storage --secret {} --tracker <this-host>:{}",
        config.cluster.secret,
        tracker.local_addr().port()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down tracker");
    tracker.shutdown().await;
    Ok(())
}

async fn cmd_storage(config: CliConfig) -> Result<()> {
    info!("starting reefd storage");

    if config.cluster.secret.is_empty() {
        bail!("a cluster secret is required (--secret, REEF_SECRET or [cluster] secret)");
    }
    if config.storage.trackers.is_empty() {
        bail!("at least one tracker is required (--tracker or [storage] trackers)");
    }

    let listener = TcpListener::bind(&config.storage.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.storage.listen_addr))?;
    let local_addr = listener.local_addr()?;

    let node = StorageNode::open(config.storage_config(), local_addr)
        .context("failed to open storage node")?;
    let handle = StorageHandle::start(Arc::new(node), listener)
        .context("failed to start storage node")?;
    info!(id = %handle.node().id(), addr = %handle.local_addr(), trackers = ?config.storage.trackers, "storage node ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down storage node");
    handle.shutdown().await;
    Ok(())
}

fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Operator commands
// -----------------------------------------------------------------------

fn operator_client(config: &CliConfig) -> Client {
    Client::new(
        Arc::new(ConnectionPool::new(config.pool_config())),
        config.storage.buffer_size,
    )
}

fn storage_endpoint(config: &CliConfig, addr: &str) -> Result<ServerEndpoint> {
    ServerEndpoint::parse(addr, &config.cluster.secret)
        .with_context(|| format!("invalid storage address {addr:?}, expected host:port"))
}

async fn cmd_upload(
    config: &CliConfig,
    file: PathBuf,
    storage: &str,
    ext: Option<String>,
) -> Result<()> {
    let server = storage_endpoint(config, storage)?;
    let mut source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let len = source.metadata().await?.len();
    let ext = ext.unwrap_or_else(|| {
        file.extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string()
    });

    let path = operator_client(config)
        .upload(&server, &mut source, len, &ext, None)
        .await
        .context("upload failed")?;
    println!("{path}");
    Ok(())
}

async fn cmd_download(config: &CliConfig, path: &str, out: PathBuf, storage: &str) -> Result<()> {
    let server = storage_endpoint(config, storage)?;
    let expected = reef_store::resolve(path).context("not a stored path or digest")?;

    let mut sink = tokio::fs::File::create(&out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;
    let result = operator_client(config)
        .download(&server, path, &mut sink)
        .await;
    drop(sink);

    let (len, digest) = match result {
        Ok(received) => received,
        Err(e) => {
            let _ = std::fs::remove_file(&out);
            return Err(e).context("download failed");
        }
    };
    if digest != expected {
        let _ = std::fs::remove_file(&out);
        bail!("downloaded content hashes to {digest}, expected {expected}");
    }
    println!("{len} bytes, md5 {digest}");
    Ok(())
}

async fn cmd_query(config: &CliConfig, path_or_md5: &str, storage: &str) -> Result<()> {
    let server = storage_endpoint(config, storage)?;
    let response = operator_client(config)
        .query(&server, path_or_md5)
        .await
        .context("query failed")?;
    if response.exists {
        println!("exists, {} bytes", response.file_size);
    } else {
        println!("not found");
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
