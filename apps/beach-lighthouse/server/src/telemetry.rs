//! Process-wide logging, span export and the hub's Prometheus metric catalog.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-lighthouse";
const OTEL_STDOUT_ENV: &str = "BEACH_LIGHTHOUSE_OTEL_STDOUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
}

/// Every series the hub emits, with the help text served on `/metrics`.
const HUB_METRICS: &[(MetricKind, &str, &str)] = &[
    (
        MetricKind::Gauge,
        "beach_lighthouse_connections_active",
        "Device websockets currently attached to the hub",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_connections_total",
        "Device websockets accepted",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_connections_closed_total",
        "Device websockets closed for any reason",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_heartbeats_total",
        "Heartbeat pings answered with a pong",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_frame_decode_failures_total",
        "Inbound frames dropped as undecodable, by reason",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_presence_notifications_total",
        "Status updates accepted by the device registry, by status",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_presence_failures_total",
        "Status updates the device registry did not accept, by status",
    ),
    (
        MetricKind::Gauge,
        "beach_lighthouse_bus_connected",
        "1 while the bus subscription is live, 0 while it is being re-established",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_bus_subscription_failures_total",
        "Bus subscription attempts that failed or timed out",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_bus_messages_total",
        "Messages received from the bus channel",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_broadcast_deliveries_total",
        "Bus messages queued to a device websocket",
    ),
    (
        MetricKind::Counter,
        "beach_lighthouse_broadcast_drops_total",
        "Bus messages skipped because a device's outbound queue was full or closed",
    ),
];

/// Keep it alive for the lifetime of the process; dropping it flushes the
/// span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = install_metrics()?;

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("span export to stdout enabled ({OTEL_STDOUT_ENV})");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

/// Installs the global Prometheus recorder and registers help text for the
/// hub's series.
fn install_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    describe_hub_metrics();
    Ok(handle)
}

fn describe_hub_metrics() {
    for &(kind, name, help) in HUB_METRICS {
        match kind {
            MetricKind::Counter => {
                describe_counter!(name, help);
            }
            MetricKind::Gauge => {
                describe_gauge!(name, help);
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{counter, gauge};
    use std::collections::HashSet;

    #[test_timeout::timeout]
    fn catalog_names_are_unique_and_prefixed() {
        let names: HashSet<_> = HUB_METRICS.iter().map(|(_, name, _)| *name).collect();
        assert_eq!(names.len(), HUB_METRICS.len());
        assert!(names.iter().all(|name| name.starts_with("beach_lighthouse_")));
        assert!(HUB_METRICS
            .iter()
            .filter(|(kind, ..)| *kind == MetricKind::Counter)
            .all(|(_, name, _)| name.ends_with("_total")));
    }

    // The only test in this crate that installs the global recorder.
    #[test_timeout::timeout]
    fn metrics_endpoint_documents_every_series() {
        let handle = install_metrics().expect("recorder installs");
        for &(kind, name, _) in HUB_METRICS {
            match kind {
                MetricKind::Counter => {
                    counter!(name, 0);
                }
                MetricKind::Gauge => {
                    gauge!(name, 0.0);
                }
            }
        }

        let rendered = handle.render();
        for &(kind, name, help) in HUB_METRICS {
            let kind = match kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
            };
            assert!(
                rendered.contains(&format!("# HELP {name} {help}")),
                "missing help for {name}"
            );
            assert!(rendered.contains(&format!("# TYPE {name} {kind}")));
        }
    }
}
