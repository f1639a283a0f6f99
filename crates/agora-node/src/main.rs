mod config;

use std::path::PathBuf;
use std::sync::Arc;

use agora_dht::DhtRouting;
use agora_protocol::{
    Collaborators, IdentityProvider, MemoryStorage, Node, NodeIdentity, OrderFeed, SqliteStorage,
    Storage,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{Overrides, Settings};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "agora-node", about = "Decentralized limit-order exchange node", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the node and print accepted order events as JSON lines.
    Run,

    /// Print this node's peer id (needs a database to be stable).
    Id,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref(), std::env::vars(), &cli.overrides)?;
    tracing::debug!(?settings, "settings resolved");

    match cli.command {
        Command::Run => run(settings).await,
        Command::Id => {
            let storage = open_storage(&settings)?;
            let identity = NodeIdentity::load_or_generate(storage.as_ref())?;
            println!("{}", identity.peer_id());
            Ok(())
        }
    }
}

fn open_storage(settings: &Settings) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match &settings.db_path {
        Some(path) => Arc::new(
            SqliteStorage::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no database configured, orders and identity are not persisted");
            Arc::new(MemoryStorage::new())
        }
    })
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let storage = open_storage(&settings)?;
    let identity = Arc::new(NodeIdentity::load_or_generate(storage.as_ref())?);
    let feed = OrderFeed::default();
    let mut events = feed.subscribe();

    let routing = Arc::new(DhtRouting::new(settings.dht_config())?);
    let node = Node::start(
        settings.node_config(),
        Collaborators::new(storage, identity, Arc::new(feed)),
        routing,
    )
    .await?;

    eprintln!("agora-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Peer ID: {}", node.peer_id());
    eprintln!("Listening on {}", node.local_addr());

    for (asset, counter) in &settings.channels {
        let channel = node.join(asset, counter)?;
        eprintln!("Joined {asset}/{counter} ({})", channel.id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "order feed lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}
