#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use beach_lighthouse_core::DeviceStatusEvent;
use beach_lighthouse_server::{
    BridgeSettings, BusConnector, BusStream, BusSubscriptionError, ConnectionRegistry, Hub,
    HubConfig, HubError, NotifyDeliveryError, Presence, PresenceNotifier,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PING: &str = r#"{"type":"heartbeat","message":"ping"}"#;
pub const PONG: &str = r#"{"type":"pong"}"#;

/// Long enough for stray notifications to surface if the hub were to send any.
pub const SETTLE: Duration = Duration::from_millis(200);

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<DeviceStatusEvent>>,
    changed: Notify,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<DeviceStatusEvent> {
        self.events.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<DeviceStatusEvent> {
        loop {
            let changed = self.changed.notified();
            {
                let events = self.events.lock();
                if events.len() >= count {
                    return events.clone();
                }
            }
            changed.await;
        }
    }
}

#[async_trait]
impl PresenceNotifier for RecordingNotifier {
    async fn notify(&self, event: &DeviceStatusEvent) -> Result<(), NotifyDeliveryError> {
        self.events.lock().push(event.clone());
        self.changed.notify_waiters();
        Ok(())
    }
}

/// In-memory bus: whatever is sent on the paired sender arrives as a bus
/// message.
pub struct ChannelBus {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    subscribed: Mutex<Option<String>>,
}

impl ChannelBus {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            receiver: Mutex::new(Some(rx)),
            subscribed: Mutex::new(None),
        };
        (Arc::new(bus), tx)
    }

    pub fn subscribed_channel(&self) -> Option<String> {
        self.subscribed.lock().clone()
    }

    pub async fn wait_until_subscribed(&self) {
        while self.subscribed_channel().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl BusConnector for ChannelBus {
    async fn subscribe(&self, channel: &str) -> Result<BusStream, BusSubscriptionError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(BusSubscriptionError::Closed)?;
        *self.subscribed.lock() = Some(channel.to_string());
        let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }
}

/// Counts subscription attempts so tests can watch the bridge retry.
#[derive(Default)]
pub struct Attempts(AtomicUsize);

impl Attempts {
    fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub async fn wait_for(&self, count: usize) {
        while self.get() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Default)]
pub struct FailingBus {
    pub attempts: Attempts,
}

#[async_trait]
impl BusConnector for FailingBus {
    async fn subscribe(&self, _channel: &str) -> Result<BusStream, BusSubscriptionError> {
        self.attempts.record();
        Err(BusSubscriptionError::Closed)
    }
}

/// A bus that accepts the connection and then never answers.
#[derive(Default)]
pub struct HangingBus {
    pub attempts: Attempts,
}

#[async_trait]
impl BusConnector for HangingBus {
    async fn subscribe(&self, _channel: &str) -> Result<BusStream, BusSubscriptionError> {
        self.attempts.record();
        std::future::pending().await
    }
}

/// First subscription ends straight away, as after a bus restart; later ones
/// are served by a `ChannelBus`.
pub struct DroppingBus {
    pub attempts: Attempts,
    inner: Arc<ChannelBus>,
}

impl DroppingBus {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (inner, publisher) = ChannelBus::new();
        let bus = Self {
            attempts: Attempts::default(),
            inner,
        };
        (Arc::new(bus), publisher)
    }
}

#[async_trait]
impl BusConnector for DroppingBus {
    async fn subscribe(&self, channel: &str) -> Result<BusStream, BusSubscriptionError> {
        if self.attempts.record() == 1 {
            return Ok(futures_util::stream::empty().boxed());
        }
        self.inner.subscribe(channel).await
    }
}

pub struct TestHub {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub notifier: Arc<RecordingNotifier>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), HubError>>,
}

impl TestHub {
    pub async fn start(bus: Arc<dyn BusConnector>) -> Self {
        let config = HubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            outbound_buffer: 8,
            bus: BridgeSettings {
                connect_timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(100),
            },
            ..HubConfig::default()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let presence = Presence::new(notifier.clone());
        let metrics = PrometheusBuilder::new().build_recorder().handle();

        let hub = Hub::start(&config, presence, bus, metrics)
            .await
            .expect("hub starts");
        let addr = hub.local_addr();
        let registry = hub.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(hub.run(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            registry,
            notifier,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/{}", self.addr, query)
    }

    pub async fn connect(&self, query: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(self.url(query))
            .await
            .expect("websocket connects");
        client
    }

    /// Connects and waits until the hub has registered the socket.
    pub async fn connect_registered(&self, query: &str) -> Client {
        let before = self.registry.len();
        let client = self.connect(query).await;
        self.wait_for_connections(before + 1).await;
        client
    }

    pub async fn wait_for_connections(&self, count: usize) {
        while self.registry.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(mut self) -> Result<(), HubError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("hub task")
    }
}

pub async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::text(text.to_string()))
        .await
        .expect("frame sent");
}

/// Next text frame, skipping control frames.
pub async fn next_text(client: &mut Client) -> String {
    loop {
        match client.next().await.expect("socket open").expect("frame") {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

pub async fn heartbeat(client: &mut Client, device_id: Option<&str>) {
    let frame = match device_id {
        Some(id) => serde_json::json!({ "type": "heartbeat", "message": "ping", "deviceId": id })
            .to_string(),
        None => PING.to_string(),
    };
    send_text(client, &frame).await;
    assert_eq!(next_text(client).await, PONG);
}
