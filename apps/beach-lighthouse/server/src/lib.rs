//! Beach Lighthouse: tracks which field devices are connected, reports their
//! presence to the device registry, and relays bus messages to all of them.

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod hub;
pub mod notifier;
pub mod registry;
pub mod telemetry;

pub use broadcast::{broadcast, BroadcastReport};
pub use bus::{
    spawn_bridge, BridgeSettings, BusConnector, BusStream, BusSubscriptionError, RedisBus,
};
pub use config::{Cli, HubConfig};
pub use hub::{Hub, HubError, HubPhase};
pub use notifier::{HttpPresenceNotifier, NotifyDeliveryError, Presence, PresenceNotifier};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, ConnectionState, RegistryStats};
