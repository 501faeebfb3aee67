//! Trezor device driver
//!
//! Every request goes through `call`, which answers button, PIN and
//! passphrase prompts until the device replies with something else.

use super::bitcoin_app::{coin_name, TrezorSignSession};
use super::bridge::BridgeClient;
use super::messages::{
    ButtonAck, Cancel, EndSession, Failure, Features, GetPublicKey, Initialize, MessageType,
    PassphraseAck, PassphraseRequest, PinMatrixAck, PublicKey, Success, TrezorMessage, TrezorProto,
    TxRequest,
};
use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::tx_request::TxSignRequest;
use crate::core::types::{status, DeviceType, HwWalletInfo};
use crate::core::wallet::compute_wallet_id;
use crate::hardware::session::{DeviceSession, OperationGuard};
use crate::hardware::DeviceInterface;
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const TREZOR_VENDOR: &str = "trezor.io";
pub const MIN_FIRMWARE_MODEL_ONE: (u32, u32, u32) = (1, 10, 0);
pub const MIN_FIRMWARE_MODEL_T: (u32, u32, u32) = (2, 3, 0);

/// Refuse firmware that predates the passphrase and signing flows used here
pub fn check_firmware(features: &Features) -> HwResult<()> {
    let minimum = if features.model_name() == "1" { MIN_FIRMWARE_MODEL_ONE } else { MIN_FIRMWARE_MODEL_T };
    if features.version() < minimum {
        return Err(HwError::UnsupportedFirmware {
            version: features.version_string(),
            minimum: format!("{}.{}.{}", minimum.0, minimum.1, minimum.2),
        });
    }
    Ok(())
}

/// Only models newer than "1" can take the passphrase on the device
pub fn passphrase_on_device(features: Option<&Features>) -> bool {
    features.map_or(false, |f| f.model_name() != "1")
}

pub struct TrezorDevice {
    session: Arc<DeviceSession>,
    bridge: BridgeClient,
    path: String,
    bridge_session: Option<String>,
    features: Option<Features>,
    testnet: bool,
}

impl TrezorDevice {
    pub fn new(
        session: Arc<DeviceSession>,
        bridge: BridgeClient,
        path: impl Into<String>,
        bridge_session: impl Into<String>,
        testnet: bool,
    ) -> Self {
        Self {
            session,
            bridge,
            path: path.into(),
            bridge_session: Some(bridge_session.into()),
            features: None,
            testnet,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn features(&self) -> Option<&Features> {
        self.features.as_ref()
    }

    fn bridge_session(&self) -> HwResult<String> {
        self.bridge_session
            .clone()
            .ok_or_else(|| HwError::Transport(format!("Trezor at {} was released", self.path)))
    }

    /// Best-effort `Cancel` after a local cancellation, the reply is only logged
    async fn send_cancel(&self, session_id: &str) {
        let cancel = TrezorMessage::new(&Cancel {});
        let path = self.path.clone();
        let queued = self
            .bridge
            .call_detached(session_id, &cancel, move |reply| match reply {
                Ok(reply) => debug!(path = %path, ?reply, "device acknowledged cancel"),
                Err(e) => warn!(path = %path, "failed to send cancel: {}", e),
            })
            .await;
        if let Err(e) = queued {
            warn!(path = %self.path, "cannot queue cancel: {}", e);
        }
    }

    /// Exchange `message`, answering prompts, and return the final reply
    async fn call(&mut self, op: &mut OperationGuard, message: TrezorMessage) -> HwResult<TrezorMessage> {
        let session_id = self.bridge_session()?;
        let mut next = message;
        loop {
            let reply = match op.run(self.bridge.call(&session_id, &next)).await {
                Ok(reply) => reply,
                Err(HwError::Cancelled) => {
                    self.send_cancel(&session_id).await;
                    return Err(HwError::Cancelled);
                }
                Err(e) => return Err(e),
            };

            next = match reply.kind() {
                Some(MessageType::ButtonRequest) => {
                    op.set_status(status::CONFIRM_ON_DEVICE);
                    op.set_blocked(true);
                    TrezorMessage::new(&ButtonAck {})
                }
                Some(MessageType::PinMatrixRequest) => match op.wait_pin().await {
                    Ok(pin) => TrezorMessage::new(&PinMatrixAck { pin: pin.expose_secret().clone() }),
                    Err(e) => {
                        self.send_cancel(&session_id).await;
                        return Err(e);
                    }
                },
                Some(MessageType::PassphraseRequest) => {
                    let _request: PassphraseRequest = reply.decode()?;
                    let allowed_on_device = passphrase_on_device(self.features.as_ref());
                    match op.wait_passphrase(allowed_on_device).await {
                        Ok((_, true)) => TrezorMessage::new(&PassphraseAck {
                            passphrase: None,
                            on_device: Some(true),
                        }),
                        Ok((passphrase, false)) => TrezorMessage::new(&PassphraseAck {
                            passphrase: Some(passphrase.expose_secret().clone()),
                            on_device: None,
                        }),
                        Err(e) => {
                            self.send_cancel(&session_id).await;
                            return Err(e);
                        }
                    }
                }
                Some(MessageType::Failure) => {
                    op.set_blocked(false);
                    let failure: Failure = reply.decode()?;
                    warn!(path = %self.path, code = ?failure.code, message = ?failure.message, "device failure");
                    // next operation starts with a fresh Initialize
                    self.features = None;
                    return Err(failure.into_error());
                }
                _ => {
                    op.set_blocked(false);
                    return Ok(reply);
                }
            };
        }
    }

    async fn request<Req, Resp>(&mut self, op: &mut OperationGuard, request: &Req) -> HwResult<Resp>
    where
        Req: TrezorProto,
        Resp: TrezorProto,
    {
        self.call(op, TrezorMessage::new(request)).await?.decode()
    }

    async fn xpub(&mut self, op: &mut OperationGuard, path: Bip32Path) -> HwResult<String> {
        debug!(path = %path, "requesting public key");
        let request = GetPublicKey {
            address_n: path.path,
            show_display: None,
            coin_name: Some(coin_name(self.testnet)),
        };
        let reply: PublicKey = self.request(op, &request).await?;
        Ok(reply.xpub)
    }

    /// `Initialize` unless features are cached, then gate on firmware
    async fn initialize(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        if self.features.is_some() {
            return Ok(());
        }
        let features: Features = self.request(op, &Initialize { session_id: None }).await?;
        check_firmware(&features)?;

        info!(
            "✅ Trezor {} model {} firmware {}",
            features.label.as_deref().unwrap_or_default(),
            features.model_name(),
            features.version_string()
        );
        let path = self.path.clone();
        self.session.update_key(|key| {
            key.id = features.device_id.clone().filter(|id| !id.is_empty()).unwrap_or(path);
            key.label = features.label.clone().unwrap_or_else(|| "Trezor".to_string());
            key.vendor = features.vendor.clone().unwrap_or_else(|| TREZOR_VENDOR.to_string());
            key.status = status::READY.to_string();
        });
        self.features = Some(features);
        Ok(())
    }
}

#[async_trait]
impl DeviceInterface for TrezorDevice {
    fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Trezor
    }

    #[instrument(skip_all, fields(path = %self.path))]
    async fn init(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        self.initialize(op).await
    }

    async fn clear_session(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        let _: Success = self.request(op, &EndSession {}).await?;
        self.features = None;
        info!(path = %self.path, "Trezor session cleared");
        Ok(())
    }

    #[instrument(skip_all, fields(path = %self.path))]
    async fn get_public_keys(&mut self, op: &mut OperationGuard) -> HwResult<HwWalletInfo> {
        self.initialize(op).await?;
        let xpub_root = self.xpub(op, Bip32Path::root()).await?;
        let xpub_native_segwit = self.xpub(op, Bip32Path::account(Purpose::Native, self.testnet)).await?;
        let xpub_nested_segwit = self.xpub(op, Bip32Path::account(Purpose::Nested, self.testnet)).await?;
        let xpub_legacy = self.xpub(op, Bip32Path::account(Purpose::NonSegWit, self.testnet)).await?;
        info!("public keys exported");

        let key = self.session.key();
        Ok(HwWalletInfo {
            wallet_type: DeviceType::Trezor,
            label: key.label,
            vendor: key.vendor,
            device_id: key.id,
            xpub_root,
            xpub_legacy,
            xpub_nested_segwit,
            xpub_native_segwit,
        })
    }

    #[instrument(skip_all, fields(path = %self.path, inputs = req.inputs.len()))]
    async fn sign_tx(&mut self, op: &mut OperationGuard, req: &TxSignRequest) -> HwResult<Vec<u8>> {
        self.initialize(op).await?;
        let mut signing = TrezorSignSession::new(req, self.testnet)?;
        let mut reply = self.call(op, TrezorMessage::new(&signing.sign_tx())).await?;

        loop {
            let request: TxRequest = reply.decode()?;
            match signing.answer(&request)? {
                Some(ack) => {
                    reply = self.call(op, TrezorMessage::new(&ack)).await?;
                }
                None => break,
            }
        }
        debug!(meta_requests = signing.meta_requests(), "signing loop finished");

        let tx = signing.finish()?;
        op.set_status(status::READY);
        info!(txid = %tx.txid(), "✅ transaction signed");
        Ok(serialize(&tx))
    }

    async fn retrieve_xpub_root(&mut self, op: &mut OperationGuard) -> HwResult<String> {
        self.initialize(op).await?;
        let xpub = self.xpub(op, Bip32Path::root()).await?;
        let wallet_id = compute_wallet_id(&xpub)?;
        self.session.update_key(|key| key.wallet_id = wallet_id);
        Ok(xpub)
    }

    async fn release(&mut self) -> HwResult<()> {
        self.features = None;
        if let Some(session_id) = self.bridge_session.take() {
            self.bridge.release(&session_id).await?;
        }
        Ok(())
    }
}
