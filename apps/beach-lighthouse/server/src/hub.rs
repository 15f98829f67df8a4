//! Connection hub: owns the listener, wires the registry, presence reporting
//! and bus bridge together, and drives the process lifecycle.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beach_lighthouse_core::{
    decode_binary_frame, decode_frame, normalize_device_id, ClientFrame, FrameDecodeError,
    Heartbeat, ServerFrame,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    bus::{spawn_bridge, BusConnector},
    config::HubConfig,
    notifier::Presence,
    registry::{Connection, ConnectionRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubPhase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server shutdown with error: {0}")]
    Serve(#[source] io::Error),
}

struct AppState {
    registry: ConnectionRegistry,
    presence: Presence,
    metrics: PrometheusHandle,
    outbound_buffer: usize,
}

/// How long a client-initiated close may take to flush the close reply.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Hub {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
    bridge: JoinHandle<()>,
}

impl Hub {
    /// Binds the listener and starts the bus bridge in the background. Only a
    /// bind failure is fatal; the bridge keeps retrying the subscription while
    /// the hub serves devices.
    pub async fn start(
        config: &HubConfig,
        presence: Presence,
        bus: Arc<dyn BusConnector>,
        metrics: PrometheusHandle,
    ) -> Result<Self, HubError> {
        log_phase(HubPhase::Starting);

        let bind_error = |source: io::Error| HubError::Bind {
            addr: config.listen_addr,
            source,
        };
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let registry = ConnectionRegistry::new();
        let bridge = spawn_bridge(bus, config.channel.clone(), registry.clone(), config.bus);

        let state = Arc::new(AppState {
            registry,
            presence,
            metrics,
            outbound_buffer: config.outbound_buffer,
        });

        Ok(Self {
            listener,
            local_addr,
            state,
            bridge,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.state.registry.clone()
    }

    /// Serves until `shutdown` resolves, then closes the bus subscription and
    /// stops accepting. Open device sockets are not drained.
    pub async fn run<F>(self, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Hub {
            listener,
            local_addr,
            state,
            bridge,
        } = self;

        let router = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/healthz", get(health_handler))
            .route("/debug/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        log_phase(HubPhase::Running);
        info!("beach-lighthouse listening on {}", local_addr);

        let stopping = async move {
            shutdown.await;
            log_phase(HubPhase::Stopping);
            bridge.abort();
            info!("bus subscription closed");
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stopping)
        .await
        .map_err(HubError::Serve)?;

        log_phase(HubPhase::Stopped);
        Ok(())
    }
}

fn log_phase(phase: HubPhase) {
    info!(?phase, "hub phase changed");
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    params: Option<Query<ConnectParams>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let device_id = params
        .and_then(|Query(params)| params.device_id)
        .and_then(|raw| normalize_device_id(&raw));

    ws.on_failed_upgrade(move |err| {
        warn!(%remote_addr, error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| handle_connection(socket, state, remote_addr, device_id))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug)]
enum CloseReason {
    ClientClosed(Option<String>),
    StreamEnded,
    ReadFailed(axum::Error),
    WriteFailed,
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    device_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.outbound_buffer);

    let connection = Connection::new(tx);
    let connection_id = connection.id();
    let active = state.registry.register(connection.clone(), device_id.clone());
    connection.mark_open();

    gauge!("beach_lighthouse_connections_active", active as f64);
    counter!("beach_lighthouse_connections_total", 1);
    info!(
        %connection_id,
        %remote_addr,
        device_id = device_id.as_deref().unwrap_or("unknown"),
        "device connected"
    );

    if let Some(device_id) = &device_id {
        state.presence.online(device_id);
    }

    // A queued Close ends the writer: closing the sink flushes the close
    // reply the socket already owes the peer.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Message::Close(_) = message {
                let _ = ws_tx.close().await;
                break;
            }
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let reason = tokio::select! {
        reason = read_frames(&state, &connection, &mut ws_rx) => reason,
        _ = &mut writer => CloseReason::WriteFailed,
    };

    if let CloseReason::ClientClosed(_) = reason {
        let flush = async {
            connection.send(Message::Close(None)).await.is_ok() && (&mut writer).await.is_ok()
        };
        let flushed = timeout(CLOSE_FLUSH_TIMEOUT, flush).await.unwrap_or(false);
        if !flushed {
            debug!(%connection_id, "close reply not flushed");
        }
    }
    writer.abort();

    match &reason {
        CloseReason::ReadFailed(err) => {
            warn!(%connection_id, error = %err, "websocket transport error")
        }
        CloseReason::WriteFailed => {
            warn!(%connection_id, "failed to write to websocket")
        }
        CloseReason::ClientClosed(_) | CloseReason::StreamEnded => {}
    }

    close_connection(&state, &connection, &reason);
}

async fn read_frames(
    state: &AppState,
    connection: &Connection,
    ws_rx: &mut SplitStream<WebSocket>,
) -> CloseReason {
    while let Some(message) = ws_rx.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => {
                debug!(connection_id = %connection.id(), %text, "frame received");
                decode_frame(&text)
            }
            Ok(Message::Binary(bytes)) => decode_binary_frame(&bytes),
            Ok(Message::Close(frame)) => {
                return CloseReason::ClientClosed(frame.map(|f| f.reason.to_string()))
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(err) => return CloseReason::ReadFailed(err),
        };

        match frame {
            Ok(ClientFrame::Heartbeat(heartbeat)) => {
                on_heartbeat(state, connection, heartbeat).await
            }
            Err(err) => on_decode_error(connection, &err),
        }
    }
    CloseReason::StreamEnded
}

async fn on_heartbeat(state: &AppState, connection: &Connection, heartbeat: Heartbeat) {
    let connection_id = connection.id();
    let device_id = match heartbeat.device_id {
        Some(device_id) => {
            let previous = state
                .registry
                .bind_device(connection_id, device_id.clone());
            if let Some(previous) = previous.filter(|previous| *previous != device_id) {
                info!(
                    %connection_id,
                    from = %previous,
                    to = %device_id,
                    "connection rebound to a different device"
                );
            }
            Some(device_id)
        }
        None => state.registry.device_for(connection_id),
    };

    counter!("beach_lighthouse_heartbeats_total", 1);
    debug!(
        %connection_id,
        device_id = device_id.as_deref().unwrap_or("unknown"),
        "heartbeat"
    );

    match ServerFrame::Pong.encode() {
        Ok(pong) => {
            if connection.send(Message::Text(pong)).await.is_err() {
                debug!(%connection_id, "writer gone before pong could be queued");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode pong"),
    }

    if let Some(device_id) = device_id {
        state.presence.online(&device_id);
    }
}

fn on_decode_error(connection: &Connection, err: &FrameDecodeError) {
    counter!(
        "beach_lighthouse_frame_decode_failures_total",
        1,
        "reason" => err.metric_label()
    );
    debug!(connection_id = %connection.id(), error = %err, "ignoring undecodable frame");
}

/// Runs once per connection: the first call marks it closed, unregisters it
/// and reports the last bound device offline.
fn close_connection(state: &AppState, connection: &Connection, reason: &CloseReason) {
    if !connection.mark_closed() {
        return;
    }

    let connection_id = connection.id();
    let device_id = state.registry.unregister(connection_id);
    gauge!(
        "beach_lighthouse_connections_active",
        state.registry.len() as f64
    );
    counter!("beach_lighthouse_connections_closed_total", 1);

    info!(
        %connection_id,
        device_id = device_id.as_deref().unwrap_or("unknown"),
        reason = ?reason,
        "device disconnected"
    );

    if let Some(device_id) = device_id {
        state.presence.offline(&device_id);
    }
}
