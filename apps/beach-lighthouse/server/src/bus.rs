//! Bridge from the external pub/sub bus to the websocket fan-out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{broadcast::broadcast, registry::ConnectionRegistry};

/// Payloads received on the subscribed channel, in arrival order.
pub type BusStream = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum BusSubscriptionError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("bus closed before the subscription was established")]
    Closed,
}

#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BusStream, BusSubscriptionError>;
}

/// Redis pub/sub transport.
#[derive(Debug, Clone)]
pub struct RedisBus {
    url: String,
}

impl RedisBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BusConnector for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<BusStream, BusSubscriptionError> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(
                        channel = %msg.get_channel_name(),
                        error = %err,
                        "dropping bus message that is not valid UTF-8"
                    );
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Timing for the bridge's subscribe loop. The retry delay doubles after
/// every failed or lost subscription, up to `max_backoff`, and resets once a
/// subscription is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl BridgeSettings {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Subscribes to `channel` and relays every payload to the open connections
/// in `registry`. Lost or failed subscriptions are retried with backoff for
/// as long as the task runs. Aborting the returned handle drops
/// the current stream, which closes the subscription.
pub fn spawn_bridge(
    bus: Arc<dyn BusConnector>,
    channel: String,
    registry: ConnectionRegistry,
    settings: BridgeSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = settings.initial_backoff;
        loop {
            match timeout(settings.connect_timeout, bus.subscribe(&channel)).await {
                Ok(Ok(stream)) => {
                    info!(%channel, "subscribed to bus channel");
                    gauge!("beach_lighthouse_bus_connected", 1.0);
                    backoff = settings.initial_backoff;

                    let relayed = forward(stream, &registry).await;

                    gauge!("beach_lighthouse_bus_connected", 0.0);
                    warn!(%channel, relayed, "bus subscription ended; resubscribing");
                }
                Ok(Err(err)) => {
                    counter!("beach_lighthouse_bus_subscription_failures_total", 1);
                    warn!(
                        %channel,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "failed to subscribe to bus; broadcasts paused"
                    );
                }
                Err(_) => {
                    counter!("beach_lighthouse_bus_subscription_failures_total", 1);
                    warn!(
                        %channel,
                        timeout_ms = settings.connect_timeout.as_millis() as u64,
                        retry_in_ms = backoff.as_millis() as u64,
                        "bus subscription timed out; broadcasts paused"
                    );
                }
            }

            sleep(backoff).await;
            backoff = settings.next_backoff(backoff);
        }
    })
}

/// Drains one subscription. Returns how many payloads it carried.
async fn forward(mut stream: BusStream, registry: &ConnectionRegistry) -> u64 {
    let mut relayed = 0;
    while let Some(payload) = stream.next().await {
        relayed += 1;
        counter!("beach_lighthouse_bus_messages_total", 1);
        debug!(payload = %payload, "bus message received");

        let report = broadcast(registry, &payload);
        if report.delivered > 0 {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                "broadcasted bus message"
            );
        }
    }
    relayed
}
