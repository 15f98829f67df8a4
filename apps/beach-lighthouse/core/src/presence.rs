use std::fmt;

use serde::{Deserialize, Serialize};

/// Online/offline state of a device as perceived by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a single status update sent to the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusEvent {
    pub device_id: String,
    pub status: DeviceStatus,
}

impl DeviceStatusEvent {
    pub fn new(device_id: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.into(),
            status,
        }
    }

    pub fn online(device_id: impl Into<String>) -> Self {
        Self::new(device_id, DeviceStatus::Online)
    }

    pub fn offline(device_id: impl Into<String>) -> Self {
        Self::new(device_id, DeviceStatus::Offline)
    }
}
