//! Trezor One / Model T through Trezor Bridge

pub mod bitcoin_app;
pub mod bridge;
pub mod client;
pub mod device;
pub mod messages;

pub use bridge::{BridgeClient, BridgeDevice, BridgeRequest, HttpBridge};
pub use client::{ClientState, TrezorClient};
pub use device::TrezorDevice;
pub use messages::TrezorMessage;
