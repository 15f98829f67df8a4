//! Best-effort presence reporting to the device registry.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use beach_lighthouse_core::DeviceStatusEvent;
use metrics::counter;
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyDeliveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

/// Destination for device status changes.
#[async_trait]
pub trait PresenceNotifier: Send + Sync + 'static {
    async fn notify(&self, event: &DeviceStatusEvent) -> Result<(), NotifyDeliveryError>;
}

/// Posts status changes to `<registry>/devices/heartbeat`.
#[derive(Clone)]
pub struct HttpPresenceNotifier {
    http: Client,
    endpoint: String,
}

impl HttpPresenceNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PresenceNotifier for HttpPresenceNotifier {
    async fn notify(&self, event: &DeviceStatusEvent) -> Result<(), NotifyDeliveryError> {
        let res = self.http.post(&self.endpoint).json(event).send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyDeliveryError::UnexpectedStatus(status))
        }
    }
}

/// Fire-and-forget front for a [`PresenceNotifier`].
///
/// Each event runs on its own task; failures are logged and discarded, never
/// retried, and the caller never waits on the outcome.
#[derive(Clone)]
pub struct Presence {
    notifier: Arc<dyn PresenceNotifier>,
}

impl Presence {
    pub fn new(notifier: Arc<dyn PresenceNotifier>) -> Self {
        Self { notifier }
    }

    pub fn online(&self, device_id: &str) -> JoinHandle<()> {
        self.dispatch(DeviceStatusEvent::online(device_id))
    }

    pub fn offline(&self, device_id: &str) -> JoinHandle<()> {
        self.dispatch(DeviceStatusEvent::offline(device_id))
    }

    pub fn dispatch(&self, event: DeviceStatusEvent) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let status = event.status.as_str();
            match notifier.notify(&event).await {
                Ok(()) => {
                    counter!(
                        "beach_lighthouse_presence_notifications_total",
                        1,
                        "status" => status
                    );
                    debug!(device_id = %event.device_id, %status, "device status updated");
                }
                Err(err) => {
                    counter!(
                        "beach_lighthouse_presence_failures_total",
                        1,
                        "status" => status
                    );
                    warn!(
                        device_id = %event.device_id,
                        %status,
                        error = %err,
                        "failed to update device status"
                    );
                }
            }
        })
    }
}
