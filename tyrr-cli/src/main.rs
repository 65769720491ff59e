use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use tyrr_core::{Client, Config, FileStore};

mod metainfo;

#[derive(Parser)]
#[command(name = "tyrr")]
#[command(about = "A swarm-protocol download client")]
struct Args {
    /// Path to the torrent file
    torrent: PathBuf,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured download directory
    #[arg(short = 'd', long)]
    download_dir: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for session state (resume files)
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Known peers to dial directly, e.g. 203.0.113.4:6881 (repeatable)
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Tags recorded in the resume state (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    args.log_level.into(),
                )),
        )
        .init();

    let config_path = args
        .config
        .unwrap_or_else(|| home().join(".config").join("tyrr").join("config.toml"));
    let mut config = Config::load(&config_path)?;
    if let Some(dir) = args.download_dir {
        config.application.download_dir = dir;
    }
    if let Some(port) = args.port {
        config.application.p2p_port = port;
    }

    let session_path = args
        .session_dir
        .unwrap_or_else(|| home().join(".local").join("share").join("tyrr"));
    std::fs::create_dir_all(&config.application.download_dir)?;
    std::fs::create_dir_all(session_path.join("torrents"))?;

    let manifest = metainfo::load(&args.torrent)?;
    info!(name = %manifest.name, info_hash = %manifest.info_hash, "loaded torrent");

    let port = config.application.p2p_port;
    let download_dir = config.application.download_dir.clone();
    let disk = Arc::new(FileStore::new(config.application.fallocate));
    let client = Client::new(config, session_path, disk);

    let handle = client.add_torrent(Arc::new(manifest), download_dir, args.tags)?;
    if !args.peers.is_empty() {
        handle.add_peers(args.peers.clone()).await?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for peers");
    let acceptor = client.clone();
    tokio::spawn(async move { acceptor.listen(listener).await });

    let mut status = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                if let Ok(stats) = handle.stats().await {
                    println!("{stats}");
                }
            }
        }
    }

    info!("shutting down");
    client.shutdown().await;
    Ok(())
}
