use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

use crate::{
    event_store::DEFAULT_MAX_EVENTS_PER_STREAM,
    gate::{GateConfig, DEFAULT_ALLOWED_ORIGINS},
    session::{
        SessionConfig, DEFAULT_CHANNEL_DEPTH, DEFAULT_IDLE_TIMEOUT, DEFAULT_PROTOCOL_VERSIONS,
        DEFAULT_REAP_INTERVAL,
    },
};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8808";
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(
    name = "beach-mcp",
    author,
    version,
    about = "Resumable MCP session transport over streamable HTTP"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_MCP_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Origin prefixes allowed to reach /mcp (comma separated).
    #[arg(
        long,
        env = "BEACH_MCP_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values_t = DEFAULT_ALLOWED_ORIGINS.map(String::from)
    )]
    pub allowed_origins: Vec<String>,

    /// Supported protocol versions, oldest first (comma separated).
    #[arg(
        long,
        env = "BEACH_MCP_PROTOCOL_VERSIONS",
        value_delimiter = ',',
        default_values_t = DEFAULT_PROTOCOL_VERSIONS.map(String::from)
    )]
    pub protocol_versions: Vec<String>,

    /// Close sessions idle for this long with no stream attached; 0 disables.
    #[arg(
        long,
        env = "BEACH_MCP_IDLE_TIMEOUT_SECS",
        default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs()
    )]
    pub idle_timeout_secs: u64,

    #[arg(
        long,
        env = "BEACH_MCP_REAP_INTERVAL_SECS",
        default_value_t = DEFAULT_REAP_INTERVAL.as_secs()
    )]
    pub reap_interval_secs: u64,

    /// Events retained per stream for Last-Event-ID replay.
    #[arg(
        long,
        env = "BEACH_MCP_MAX_EVENTS_PER_STREAM",
        default_value_t = DEFAULT_MAX_EVENTS_PER_STREAM
    )]
    pub max_events_per_stream: usize,

    /// Buffered frames per SSE stream before a slow client is detached.
    #[arg(long, env = "BEACH_MCP_PUSH_CHANNEL_DEPTH", default_value_t = DEFAULT_CHANNEL_DEPTH)]
    pub push_channel_depth: usize,

    #[arg(long, env = "BEACH_MCP_KEEP_ALIVE_SECS", default_value_t = DEFAULT_KEEP_ALIVE.as_secs())]
    pub keep_alive_secs: u64,

    #[arg(long, env = "BEACH_MCP_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_MCP_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub protocol_versions: Vec<String>,
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    pub max_events_per_stream: usize,
    pub push_channel_depth: usize,
    pub keep_alive: Duration,
    pub max_body_bytes: usize,
    pub shutdown_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8808)),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.map(String::from).to_vec(),
            protocol_versions: DEFAULT_PROTOCOL_VERSIONS.map(String::from).to_vec(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            reap_interval: DEFAULT_REAP_INTERVAL,
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
            push_channel_depth: DEFAULT_CHANNEL_DEPTH,
            keep_alive: DEFAULT_KEEP_ALIVE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            protocol_versions: self.protocol_versions.clone(),
            push_channel_depth: self.push_channel_depth,
            idle_timeout: self.idle_timeout,
            reap_interval: self.reap_interval,
            ..SessionConfig::default()
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            allowed_origins: self.allowed_origins.clone(),
            supported_versions: self.protocol_versions.clone(),
        }
    }

    fn normalize_list(values: Vec<String>) -> Vec<String> {
        values
            .into_iter()
            .filter_map(|value| {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect()
    }
}

impl TryFrom<Cli> for TransportConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let protocol_versions = Self::normalize_list(cli.protocol_versions);
        if protocol_versions.is_empty() {
            bail!("at least one protocol version must be supported");
        }
        if cli.push_channel_depth == 0 {
            bail!("push channel depth must be at least 1");
        }
        if cli.max_events_per_stream == 0 {
            bail!("max events per stream must be at least 1");
        }
        if cli.reap_interval_secs == 0 {
            bail!("reap interval must be at least one second");
        }

        Ok(TransportConfig {
            listen_addr,
            allowed_origins: Self::normalize_list(cli.allowed_origins),
            protocol_versions,
            idle_timeout: (cli.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(cli.idle_timeout_secs)),
            reap_interval: Duration::from_secs(cli.reap_interval_secs),
            max_events_per_stream: cli.max_events_per_stream,
            push_channel_depth: cli.push_channel_depth,
            keep_alive: Duration::from_secs(cli.keep_alive_secs.max(1)),
            max_body_bytes: cli.max_body_bytes,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
