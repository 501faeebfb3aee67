//! Device events and the callback sink they are delivered to

use crate::core::types::{DeviceKey, HwWalletInfo};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything the device layer reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Scan finished, deduplicated key list
    DevicesChanged(Vec<DeviceKey>),
    PublicKeyReady(HwWalletInfo),
    DeviceTxStatusChanged { key: DeviceKey, status: String },
    OperationFailed { key: DeviceKey, reason: String },
    /// Transport lost, caller should scan again
    RequestForRescan(DeviceKey),
    RequestPinMatrix(DeviceKey),
    RequestHwPass { key: DeviceKey, allowed_on_device: bool },
    CancelledOnDevice(DeviceKey),
    InvalidPin(DeviceKey),
    /// Device bound to the wallet id is attached
    DeviceReady(String),
    DeviceNotFound(String),
    TxSigned(Vec<u8>),
}

pub trait DeviceCallbacks: Send + Sync {
    fn on_event(&self, event: DeviceEvent);
}

/// Forwards events to an unbounded channel
pub struct ChannelCallbacks {
    sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeviceCallbacks for ChannelCallbacks {
    fn on_event(&self, event: DeviceEvent) {
        if self.sender.send(event).is_err() {
            warn!("device event dropped, receiver closed");
        }
    }
}

/// Logs every event, used by the CLI
pub struct TracingCallbacks;

impl DeviceCallbacks for TracingCallbacks {
    fn on_event(&self, event: DeviceEvent) {
        match &event {
            DeviceEvent::OperationFailed { key, reason } => {
                warn!(device = %key, "operation failed: {}", reason)
            }
            DeviceEvent::RequestPinMatrix(key) => info!(device = %key, "PIN requested"),
            DeviceEvent::RequestHwPass { key, allowed_on_device } => {
                info!(device = %key, allowed_on_device, "passphrase requested")
            }
            DeviceEvent::DeviceTxStatusChanged { key, status } => {
                info!(device = %key, "status: {}", status)
            }
            other => info!("device event: {:?}", other),
        }
    }
}

pub struct NullCallbacks;

impl DeviceCallbacks for NullCallbacks {
    fn on_event(&self, _event: DeviceEvent) {}
}
