//! Hardware wallet device layer
//!
//! One driver per family (Ledger HID, Trezor bridge, Jade serial), each
//! implementing `DeviceInterface`, plus a client per family that discovers
//! devices and owns their handles. `DeviceManager` routes across families.

use crate::core::errors::HwResult;
use crate::core::tx_request::TxSignRequest;
use crate::core::types::{DeviceKey, DeviceType, HwWalletInfo};
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

pub mod events;
pub mod jade;
pub mod ledger;
pub mod manager;
pub mod session;
pub mod trezor;

pub use events::{ChannelCallbacks, DeviceCallbacks, DeviceEvent, NullCallbacks, TracingCallbacks};
pub use manager::DeviceManager;
pub use session::{DeviceHandle, DeviceSession, OperationGuard, PromptReply};

/// Capability set of one attached device
///
/// Operations that talk to the device receive the `OperationGuard` created by
/// the handle; prompts, cancellation and status updates go through it.
#[async_trait]
pub trait DeviceInterface: Send {
    fn session(&self) -> &Arc<DeviceSession>;

    fn device_type(&self) -> DeviceType;

    fn key(&self) -> DeviceKey {
        self.session().key()
    }

    /// Open the transport and read device info; idempotent
    async fn init(&mut self, op: &mut OperationGuard) -> HwResult<()>;

    async fn clear_session(&mut self, op: &mut OperationGuard) -> HwResult<()>;

    async fn get_public_keys(&mut self, op: &mut OperationGuard) -> HwResult<HwWalletInfo>;

    /// Serialized signed transaction
    async fn sign_tx(&mut self, op: &mut OperationGuard, req: &TxSignRequest) -> HwResult<Vec<u8>>;

    /// m/0' xpub
    async fn retrieve_xpub_root(&mut self, op: &mut OperationGuard) -> HwResult<String>;

    /// Close the transport, the device can be re-initialized afterwards
    async fn release(&mut self) -> HwResult<()>;

    fn cancel(&self) {
        self.session().cancel();
    }

    fn is_blocked(&self) -> bool {
        self.session().is_blocked()
    }

    fn last_error(&self) -> Option<String> {
        self.session().last_error()
    }

    fn set_matrix_pin(&self, pin: SecretString) -> HwResult<()> {
        self.session().submit_prompt(PromptReply::Pin(pin))
    }

    fn set_passphrase(&self, passphrase: SecretString, on_device: bool) -> HwResult<()> {
        self.session()
            .submit_prompt(PromptReply::Passphrase { passphrase, on_device })
    }
}

/// Discovery and ownership for one device family
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Rediscover attached devices, replacing previously held handles
    async fn scan_devices(&self) -> HwResult<Vec<DeviceKey>>;

    fn device_keys(&self) -> Vec<DeviceKey>;

    fn device(&self, id: &str) -> Option<DeviceHandle>;

    async fn release_all(&self);
}
