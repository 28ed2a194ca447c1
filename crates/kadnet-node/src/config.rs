//! Node configuration

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use kadnet_core::ServeConfig;
use kadnet_dht::DhtConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Port used when nothing else is configured, and for seeds given without one.
pub const DEFAULT_PORT: u16 = 60000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and peer addresses
    pub network: NetworkConfig,

    /// Routing parameters
    pub dht: DhtSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port to accept connections on (0 picks a free port)
    pub listen_port: u16,
    /// Local address to bind
    pub bind_address: String,
    /// Address other peers reach this node at
    pub public_address: String,
    /// Seed peers as `host` or `host:port`
    pub seeds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// Identifier width in bits
    pub id_bits: u16,
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    /// Outbound request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Time an inbound connection gets to deliver its request, in milliseconds
    pub inbound_timeout_ms: u64,
    /// Seconds between bucket refresh rounds
    pub refresh_interval_secs: u64,
    /// Buckets refreshed per round
    pub refresh_batch: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            public_address: "127.0.0.1".to_string(),
            seeds: vec![],
        }
    }
}

impl Default for DhtSettings {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            id_bits: dht.id_bits,
            k: dht.k,
            alpha: dht.alpha,
            request_timeout_ms: dht.request_timeout.as_millis() as u64,
            inbound_timeout_ms: 5_000,
            refresh_interval_secs: dht.refresh_interval.as_secs(),
            refresh_batch: dht.refresh_batch,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        self.public_ip()?;
        self.dht_config().validate()?;

        if self.dht.inbound_timeout_ms == 0 {
            bail!("dht.inbound_timeout_ms must be non-zero");
        }

        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .network
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", self.network.bind_address))?;
        Ok(SocketAddr::new(ip, self.network.listen_port))
    }

    /// Address advertised to other peers, without the port.
    pub fn public_ip(&self) -> anyhow::Result<IpAddr> {
        self.network.public_address.parse().with_context(|| {
            format!(
                "Invalid public address {:?}",
                self.network.public_address
            )
        })
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            id_bits: self.dht.id_bits,
            k: self.dht.k,
            alpha: self.dht.alpha,
            request_timeout: Duration::from_millis(self.dht.request_timeout_ms),
            refresh_interval: Duration::from_secs(self.dht.refresh_interval_secs),
            refresh_batch: self.dht.refresh_batch,
        }
    }

    pub fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            id_bits: self.dht.id_bits,
            read_timeout: Duration::from_millis(self.dht.inbound_timeout_ms),
        }
    }

    /// Resolve the configured seeds, dropping the ones that do not resolve.
    ///
    /// Seeds without a port use `listen_port`, or [`DEFAULT_PORT`] when that is 0.
    pub async fn resolve_seeds(&self) -> Vec<SocketAddr> {
        let mut seeds = Vec::with_capacity(self.network.seeds.len());
        // An ephemeral listen port says nothing about where seeds listen.
        let port = match self.network.listen_port {
            0 => DEFAULT_PORT,
            port => port,
        };

        for seed in &self.network.seeds {
            let target = with_default_port(seed, port);
            match tokio::net::lookup_host(&target).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => seeds.push(addr),
                    None => warn!("Seed {} resolved to no address", seed),
                },
                Err(e) => warn!("Failed to resolve seed {}: {}", seed, e),
            };
        }

        seeds
    }
}

/// Append `port` to a seed given as a bare host or IP address.
fn with_default_port(seed: &str, port: u16) -> String {
    if seed.parse::<SocketAddr>().is_ok() {
        return seed.to_string();
    }
    if let Ok(ip) = seed.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match seed.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => seed.to_string(),
        _ => format!("{seed}:{port}"),
    }
}
