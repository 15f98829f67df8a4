use axum::extract::ws::Message;
use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was enqueued for.
    pub delivered: usize,
    /// Open connections whose outbound queue was full.
    pub dropped: usize,
    /// Connections skipped because they were not open.
    pub skipped: usize,
}

/// Writes `payload` as a text frame to every open connection.
///
/// Nothing is buffered on behalf of a slow client: if its queue is full the
/// payload is simply not delivered to it.
pub fn broadcast(registry: &ConnectionRegistry, payload: &str) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for connection in registry.active_connections() {
        if !connection.is_open() {
            report.skipped += 1;
            continue;
        }
        match connection.try_send(Message::Text(payload.to_owned())) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                debug!(
                    connection_id = %connection.id(),
                    "outbound queue full; broadcast dropped"
                );
            }
            Err(TrySendError::Closed(_)) => report.skipped += 1,
        }
    }

    if report.delivered > 0 {
        counter!(
            "beach_lighthouse_broadcast_deliveries_total",
            report.delivered as u64
        );
    }
    if report.dropped > 0 {
        counter!(
            "beach_lighthouse_broadcast_drops_total",
            report.dropped as u64
        );
    }

    report
}
