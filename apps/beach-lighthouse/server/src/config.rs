use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use clap::Parser;

use crate::bus::BridgeSettings;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_CHANNEL: &str = "rfid_updates";
const DEFAULT_REGISTRY_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Parser)]
#[command(
    name = "beach-lighthouse",
    author,
    version,
    about = "Device presence and broadcast hub for Beach field devices"
)]
pub struct Cli {
    /// Interface the websocket listener binds to.
    #[arg(long, env = "BEACH_LIGHTHOUSE_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    /// Port the websocket listener binds to.
    #[arg(long, env = "WS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Redis host carrying the broadcast channel.
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Pub/sub channel whose messages are relayed to every device.
    #[arg(long, env = "REDIS_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub redis_channel: String,

    /// Base URL of the device registry API; status updates go to
    /// `<url>/devices/heartbeat`.
    #[arg(long, env = "DEVICE_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
    pub registry_url: String,

    /// Upper bound on a single status update request.
    #[arg(long, env = "BEACH_LIGHTHOUSE_NOTIFY_TIMEOUT_SECS", default_value_t = 5)]
    pub notify_timeout_secs: u64,

    /// Frames queued per connection before broadcasts to it are dropped.
    #[arg(long, env = "BEACH_LIGHTHOUSE_OUTBOUND_BUFFER", default_value_t = 32)]
    pub outbound_buffer: usize,

    /// Give up on a single bus subscription attempt after this long.
    #[arg(long, env = "BEACH_LIGHTHOUSE_BUS_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub bus_connect_timeout_secs: u64,

    /// Longest pause between bus resubscription attempts.
    #[arg(long, env = "BEACH_LIGHTHOUSE_BUS_RETRY_MAX_SECS", default_value_t = 30)]
    pub bus_retry_max_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub channel: String,
    pub registry_url: String,
    pub notify_timeout: Duration,
    pub outbound_buffer: usize,
    pub bus: BridgeSettings,
}

impl HubConfig {
    /// Full URL of the registry's heartbeat endpoint.
    pub fn heartbeat_endpoint(&self) -> String {
        format!("{}/devices/heartbeat", self.registry_url)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            redis_url: "redis://localhost:6379".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            notify_timeout: Duration::from_secs(5),
            outbound_buffer: 32,
            bus: BridgeSettings::default(),
        }
    }
}

impl TryFrom<Cli> for HubConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let ip: IpAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.outbound_buffer > 0, "outbound buffer must be at least 1");
        ensure!(!cli.redis_channel.is_empty(), "redis channel must not be empty");
        ensure!(
            cli.bus_connect_timeout_secs > 0,
            "bus connect timeout must be at least 1 second"
        );

        let defaults = BridgeSettings::default();
        let bus = BridgeSettings {
            connect_timeout: Duration::from_secs(cli.bus_connect_timeout_secs),
            max_backoff: Duration::from_secs(cli.bus_retry_max_secs).max(defaults.initial_backoff),
            ..defaults
        };

        Ok(HubConfig {
            listen_addr: SocketAddr::new(ip, cli.port),
            redis_url: format!("redis://{}:{}", cli.redis_host, cli.redis_port),
            channel: cli.redis_channel,
            registry_url: cli.registry_url.trim_end_matches('/').to_string(),
            notify_timeout: Duration::from_secs(cli.notify_timeout_secs),
            outbound_buffer: cli.outbound_buffer,
            bus,
        })
    }
}
