//! Shared primitives for the Beach Lighthouse device hub: the heartbeat wire
//! protocol spoken by field devices and the presence events reported to the
//! device registry.

pub mod presence;
pub mod protocol;

pub use presence::{DeviceStatus, DeviceStatusEvent};
pub use protocol::{
    decode_binary_frame, decode_frame, normalize_device_id, ClientFrame, FrameDecodeError,
    Heartbeat, ServerFrame,
};
