//! Node settings, layered: defaults, then an optional TOML file, then
//! `AGORA_*` environment variables, then command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agora_dht::DhtConfig;
use agora_protocol::{DiscoveryConfig, NodeConfig};
use agora_transport::HostConfig;
use anyhow::{bail, Context};
use serde::Deserialize;

/// Contents of the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<SocketAddr>,
    /// SQLite database; orders and identity are kept in memory without it.
    pub db_path: Option<PathBuf>,
    pub rendezvous: Option<String>,
    pub seeds: Vec<SocketAddr>,
    pub dht_bootstrap: Vec<String>,
    pub dht_port: Option<u16>,
    pub requery_secs: Option<u64>,
    pub advertise_secs: Option<u64>,
    pub max_message_size: Option<usize>,
    /// Pairs joined at startup, as `"ASSET/COUNTER"`.
    pub channels: Vec<String>,
}

/// Command-line overrides.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// TCP listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// SQLite database path.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Global rendezvous topic.
    #[arg(long)]
    pub rendezvous: Option<String>,

    /// Seed peer address (repeatable).
    #[arg(long = "seed")]
    pub seeds: Vec<SocketAddr>,

    /// Channel to join, as ASSET/COUNTER (repeatable).
    #[arg(long = "join")]
    pub channels: Vec<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub rendezvous: String,
    pub seeds: Vec<SocketAddr>,
    pub dht_bootstrap: Vec<String>,
    pub dht_port: Option<u16>,
    pub requery_interval: Duration,
    pub advertise_interval: Duration,
    pub max_message_size: usize,
    pub channels: Vec<(String, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        let discovery = DiscoveryConfig::new();
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            db_path: None,
            rendezvous: discovery.get_rendezvous().to_string(),
            seeds: Vec::new(),
            dht_bootstrap: Vec::new(),
            dht_port: None,
            requery_interval: Duration::from_secs(15),
            advertise_interval: Duration::from_secs(300),
            max_message_size: 1024 * 1024,
            channels: Vec::new(),
        }
    }
}

impl Settings {
    /// Resolve every layer. `env` is usually `std::env::vars()`.
    pub fn load(
        file: Option<&Path>,
        env: impl IntoIterator<Item = (String, String)>,
        overrides: &Overrides,
    ) -> anyhow::Result<Self> {
        let mut settings = Self::default();
        if let Some(path) = file {
            settings.apply_file(load_file(path)?)?;
        }
        settings.apply_env(env)?;
        settings.apply_overrides(overrides)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.requery_interval.is_zero() {
            bail!("requery_secs must be at least 1");
        }
        if self.advertise_interval.is_zero() {
            bail!("advertise_secs must be at least 1");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be at least 1");
        }
        Ok(())
    }

    fn apply_file(&mut self, file: FileConfig) -> anyhow::Result<()> {
        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr;
        }
        if file.db_path.is_some() {
            self.db_path = file.db_path;
        }
        if let Some(rendezvous) = file.rendezvous {
            self.rendezvous = rendezvous;
        }
        self.seeds.extend(file.seeds);
        self.dht_bootstrap.extend(file.dht_bootstrap);
        if file.dht_port.is_some() {
            self.dht_port = file.dht_port;
        }
        if let Some(secs) = file.requery_secs {
            self.requery_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.advertise_secs {
            self.advertise_interval = Duration::from_secs(secs);
        }
        if let Some(size) = file.max_message_size {
            self.max_message_size = size;
        }
        for pair in &file.channels {
            self.channels.push(parse_pair(pair)?);
        }
        Ok(())
    }

    fn apply_env(&mut self, env: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<()> {
        for (key, value) in env {
            match key.as_str() {
                "AGORA_LISTEN_ADDR" => {
                    self.listen_addr = value
                        .parse()
                        .with_context(|| format!("AGORA_LISTEN_ADDR={value}"))?;
                }
                "AGORA_DB" => self.db_path = Some(PathBuf::from(value)),
                "AGORA_RENDEZVOUS" => self.rendezvous = value,
                "AGORA_SEEDS" => {
                    for seed in split_list(&value) {
                        self.seeds.push(
                            seed.parse()
                                .with_context(|| format!("AGORA_SEEDS entry {seed:?}"))?,
                        );
                    }
                }
                "AGORA_DHT_BOOTSTRAP" => {
                    self.dht_bootstrap
                        .extend(split_list(&value).map(str::to_string));
                }
                "AGORA_CHANNELS" => {
                    for pair in split_list(&value) {
                        self.channels.push(parse_pair(pair)?);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) -> anyhow::Result<()> {
        if let Some(addr) = overrides.listen {
            self.listen_addr = addr;
        }
        if let Some(db) = &overrides.db {
            self.db_path = Some(db.clone());
        }
        if let Some(rendezvous) = &overrides.rendezvous {
            self.rendezvous = rendezvous.clone();
        }
        self.seeds.extend(&overrides.seeds);
        for pair in &overrides.channels {
            self.channels.push(parse_pair(pair)?);
        }
        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::new()
            .host(
                HostConfig::new()
                    .listen_addr(self.listen_addr)
                    .max_message_size(self.max_message_size),
            )
            .discovery(
                DiscoveryConfig::new()
                    .rendezvous(self.rendezvous.clone())
                    .seeds(self.seeds.clone())
                    .requery_interval(self.requery_interval)
                    .advertise_interval(self.advertise_interval),
            )
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            bootstrap: self.dht_bootstrap.clone(),
            port: self.dht_port,
            ..DhtConfig::default()
        }
    }
}

/// Read and parse the TOML file at `path`.
pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// `"ETH/BTC"` → `("ETH", "BTC")`.
fn parse_pair(pair: &str) -> anyhow::Result<(String, String)> {
    match pair.split_once('/') {
        Some((asset, counter)) if !asset.is_empty() && !counter.is_empty() => {
            Ok((asset.trim().to_string(), counter.trim().to_string()))
        }
        _ => bail!("channel {pair:?} is not of the form ASSET/COUNTER"),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
