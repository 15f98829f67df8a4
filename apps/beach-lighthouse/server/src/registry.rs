//! In-memory record of every websocket currently attached to the hub and the
//! device each one claims to be.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use axum::extract::ws::Message;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{
    self,
    error::{SendError, TrySendError},
};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Shared handle to one accepted websocket.
///
/// The connection task owns the socket itself; clones of this handle give
/// other tasks (the registry, fan-out) a way to enqueue outbound frames and
/// observe the lifecycle state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    state: AtomicU8,
    sender: mpsc::Sender<Message>,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                sender,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Connecting -> Open. Returns false if the connection already moved on.
    pub fn mark_open(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to the terminal state. Returns true only for the first call.
    pub fn mark_closed(&self) -> bool {
        self.inner
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            != ConnectionState::Closed as u8
    }

    /// Open and its writer task is still draining the outbound queue.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.inner.sender.is_closed()
    }

    pub fn try_send(&self, message: Message) -> Result<(), TrySendError<Message>> {
        self.inner.sender.try_send(message)
    }

    pub async fn send(&self, message: Message) -> Result<(), SendError<Message>> {
        self.inner.sender.send(message).await
    }
}

struct RegistryEntry {
    connection: Connection,
    device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub identified_connections: usize,
    pub distinct_devices: usize,
}

/// Cloneable handle to the set of attached connections. A single mutex guards
/// every operation so snapshots are consistent point-in-time copies.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, RegistryEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection and the device id it was opened with. Returns the
    /// number of registered connections afterwards.
    pub fn register(&self, connection: Connection, device_id: Option<String>) -> usize {
        let mut guard = self.inner.lock();
        guard.insert(
            connection.id(),
            RegistryEntry {
                connection,
                device_id,
            },
        );
        guard.len()
    }

    /// Rebinds a registered connection to `device_id` and returns the id it
    /// was previously bound to. Unknown connections are ignored.
    pub fn bind_device(&self, connection_id: ConnectionId, device_id: String) -> Option<String> {
        let mut guard = self.inner.lock();
        guard
            .get_mut(&connection_id)
            .and_then(|entry| entry.device_id.replace(device_id))
    }

    pub fn device_for(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner
            .lock()
            .get(&connection_id)
            .and_then(|entry| entry.device_id.clone())
    }

    /// Removes a connection and returns the last device id it was bound to.
    /// A second call for the same connection returns `None`.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner
            .lock()
            .remove(&connection_id)
            .and_then(|entry| entry.device_id)
    }

    pub fn active_connections(&self) -> Vec<Connection> {
        self.inner
            .lock()
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let guard = self.inner.lock();
        let devices: HashSet<&str> = guard
            .values()
            .filter_map(|entry| entry.device_id.as_deref())
            .collect();
        RegistryStats {
            connections: guard.len(),
            identified_connections: guard
                .values()
                .filter(|entry| entry.device_id.is_some())
                .count(),
            distinct_devices: devices.len(),
        }
    }
}
