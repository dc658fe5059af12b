// Veil Linux daemon: runs the configured client, server and router peers.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use veil_core::journal::{self, Journal};
use veil_core::{FileRef, Peer, PeerRegistry, Role};

/// How long stopping machines may take before the daemon exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Anonymous multi-hop file sharing", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $VEIL_CONFIG, ~/.config/veil/config.toml, /etc/veil/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled peer until interrupted (default)
    Run {
        /// Write the peer list back to the config file on exit
        #[arg(long)]
        save: bool,
    },
    /// Ask the server behind a client peer who it is
    Info {
        /// Client peer name
        #[arg(short, long)]
        peer: String,
    },
    /// Search shared file names
    Search {
        #[arg(short, long)]
        peer: String,
        keyword: String,
    },
    /// List a shared folder
    Browse {
        #[arg(short, long)]
        peer: String,
        /// Folder id; the share root when omitted
        #[arg(default_value = "")]
        folder: String,
    },
    /// Download a shared file into the peer's download folder
    Download {
        #[arg(short, long)]
        peer: String,
        /// File id as printed by search or browse
        file: String,
    },
    /// Upload a local file to the server's upload folder
    Upload {
        #[arg(short, long)]
        peer: String,
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (cfg, path) = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command.unwrap_or(Commands::Run { save: false }) {
            Commands::Run { save } => run(cfg, path, save).await,
            Commands::Info { peer } => {
                let info = client_peer(&cfg, &peer)?.info().await?;
                println!(
                    "{} ({:?}) protocol {} sessions {}",
                    info.name, info.role, info.version, info.sessions
                );
                Ok(())
            }
            Commands::Search { peer, keyword } => {
                for file in client_peer(&cfg, &peer)?.search(&keyword).await? {
                    println!("{}\t{}", file.id, file.size);
                }
                Ok(())
            }
            Commands::Browse { peer, folder } => {
                let folder = FileRef {
                    id: folder,
                    ..FileRef::default()
                };
                let listing = client_peer(&cfg, &peer)?.browse(&folder).await?;
                for dir in listing.folders {
                    println!("{}/", dir.id);
                }
                for file in listing.files {
                    println!("{}\t{}", file.id, file.size);
                }
                Ok(())
            }
            Commands::Download { peer, file } => {
                let descriptor = find_peer(&cfg, &peer)?;
                let client = veil_core::Client::for_peer(descriptor, Journal::disabled());
                let name = file.rsplit('/').next().unwrap_or_default().to_string();
                let file = FileRef {
                    id: file,
                    name: name.clone(),
                    size: 0,
                };
                let dest = descriptor.options.download_folder.join(&name);
                let bytes = client.download(&file, &dest).await?;
                println!("{} ({bytes} bytes)", dest.display());
                Ok(())
            }
            Commands::Upload { peer, path } => {
                let bytes = client_peer(&cfg, &peer)?.upload(&path).await?;
                println!("{} ({bytes} bytes)", path.display());
                Ok(())
            }
        }
    })
}

fn find_peer<'a>(cfg: &'a config::Config, name: &str) -> anyhow::Result<&'a Peer> {
    let peer = cfg
        .peers
        .iter()
        .find(|p| p.name == name)
        .with_context(|| format!("no peer named {name}"))?;
    anyhow::ensure!(peer.role == Role::Client, "peer {name} is not a client");
    Ok(peer)
}

fn client_peer(cfg: &config::Config, name: &str) -> anyhow::Result<veil_core::Client> {
    Ok(veil_core::Client::for_peer(find_peer(cfg, name)?, Journal::disabled()))
}

async fn run(cfg: config::Config, path: PathBuf, save: bool) -> anyhow::Result<()> {
    let (journal, exchanges) = Journal::channel();
    let consumer = journal::spawn_tracing_consumer(exchanges);
    let registry = PeerRegistry::new(journal);
    for peer in cfg.peers {
        if !peer.is_valid() {
            tracing::warn!(peer = %peer.name, "peer is incomplete; it will report a warning");
        }
        registry.add(peer)?;
    }
    registry.start_enabled();
    tracing::info!(peers = registry.peers().len(), config = %path.display(), "veil running");

    shutdown_signal().await?;
    tracing::info!("shutting down");
    registry.shutdown(SHUTDOWN_GRACE).await;
    consumer.abort();

    if save {
        let cfg = config::Config {
            peers: registry.peers(),
        };
        cfg.save(&path)?;
        tracing::info!(path = %path.display(), "config saved");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
