use std::sync::Arc;

use anyhow::{Context, Result};
use beach_lighthouse_server::{
    telemetry::Telemetry, Cli, HttpPresenceNotifier, Hub, HubConfig, Presence, RedisBus,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = HubConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis_url = %config.redis_url,
        channel = %config.channel,
        registry = %config.heartbeat_endpoint(),
        "starting beach-lighthouse"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: HubConfig, metrics: PrometheusHandle) -> Result<()> {
    let notifier = HttpPresenceNotifier::new(config.heartbeat_endpoint(), config.notify_timeout)
        .context("failed to build device registry client")?;
    let presence = Presence::new(Arc::new(notifier));
    let bus = Arc::new(RedisBus::new(config.redis_url.clone()));

    let hub = Hub::start(&config, presence, bus, metrics).await?;
    hub.run(shutdown_signal()).await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
