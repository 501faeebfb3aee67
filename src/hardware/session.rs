//! Per-device operation gate
//!
//! A `DeviceSession` is shared between a device driver and whoever holds its
//! `DeviceHandle`. Starting an operation returns an `OperationGuard`; all
//! per-operation state (cancellation token, pending prompt, blocked flag)
//! lives in the guard and is reset when it drops, on every exit path.

use crate::core::errors::{HwError, HwResult};
use crate::core::tx_request::TxSignRequest;
use crate::core::types::{status, DeviceKey, DeviceType, HwWalletInfo};
use crate::hardware::events::{DeviceCallbacks, DeviceEvent};
use crate::hardware::DeviceInterface;
use crate::tools::async_support::{execute_with_timeout, OperationTimer, TimeoutConfig};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer to a device prompt
#[derive(Debug)]
pub enum PromptReply {
    /// PIN as positions on the scrambled matrix
    Pin(SecretString),
    Passphrase { passphrase: SecretString, on_device: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Pin,
    Passphrase,
}

pub struct DeviceSession {
    key: RwLock<DeviceKey>,
    busy: AtomicBool,
    blocked: AtomicBool,
    last_error: RwLock<Option<String>>,
    current: Mutex<Option<CancellationToken>>,
    awaiting: Mutex<Option<PromptKind>>,
    prompt_sender: Mutex<Option<mpsc::UnboundedSender<PromptReply>>>,
    callbacks: Arc<dyn DeviceCallbacks>,
}

impl DeviceSession {
    pub fn new(key: DeviceKey, callbacks: Arc<dyn DeviceCallbacks>) -> Arc<Self> {
        Arc::new(Self {
            key: RwLock::new(key),
            busy: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            last_error: RwLock::new(None),
            current: Mutex::new(None),
            awaiting: Mutex::new(None),
            prompt_sender: Mutex::new(None),
            callbacks,
        })
    }

    pub fn key(&self) -> DeviceKey {
        self.key.read().clone()
    }

    pub fn update_key(&self, update: impl FnOnce(&mut DeviceKey)) {
        update(&mut *self.key.write());
    }

    pub fn emit(&self, event: DeviceEvent) {
        self.callbacks.on_event(event);
    }

    pub fn callbacks(&self) -> Arc<dyn DeviceCallbacks> {
        Arc::clone(&self.callbacks)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn record_error(&self, reason: impl Into<String>) {
        *self.last_error.write() = Some(reason.into());
    }

    /// Start an operation, fails fast when another one is in flight
    pub fn begin(self: &Arc<Self>, name: &'static str) -> HwResult<OperationGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(device = %self.key(), operation = name, "device busy, rejecting operation");
            return Err(HwError::DeviceBusy);
        }

        let token = CancellationToken::new();
        let (sender, prompts) = mpsc::unbounded_channel();
        *self.current.lock() = Some(token.clone());
        *self.prompt_sender.lock() = Some(sender);
        debug!(device = %self.key(), operation = name, "operation started");

        Ok(OperationGuard { session: Arc::clone(self), name, token, prompts })
    }

    /// Abort the in-flight operation; no-op when idle
    pub fn cancel(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                info!(device = %self.key(), "cancelling current operation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn submit_prompt(&self, reply: PromptReply) -> HwResult<()> {
        let mut awaiting = self.awaiting.lock();
        match (*awaiting, &reply) {
            (Some(PromptKind::Pin), PromptReply::Pin(_))
            | (Some(PromptKind::Passphrase), PromptReply::Passphrase { .. }) => {}
            (None, _) => {
                return Err(HwError::InvalidRequest("device is not waiting for input".into()))
            }
            (Some(kind), _) => {
                return Err(HwError::InvalidRequest(format!("device is waiting for {:?}", kind)))
            }
        }
        let sender = self
            .prompt_sender
            .lock()
            .clone()
            .ok_or_else(|| HwError::InvalidRequest("no operation in progress".into()))?;
        sender
            .send(reply)
            .map_err(|_| HwError::InvalidRequest("operation already finished".into()))?;
        *awaiting = None;
        Ok(())
    }

    fn reset(&self) {
        *self.current.lock() = None;
        *self.awaiting.lock() = None;
        *self.prompt_sender.lock() = None;
        self.blocked.store(false, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Per-operation state, reset on drop
pub struct OperationGuard {
    session: Arc<DeviceSession>,
    name: &'static str,
    token: CancellationToken,
    prompts: mpsc::UnboundedReceiver<PromptReply>,
}

impl OperationGuard {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn emit(&self, event: DeviceEvent) {
        self.session.emit(event);
    }

    /// Update the key status and report it
    pub fn set_status(&self, text: &str) {
        self.session.update_key(|key| key.status = text.to_string());
        self.session.emit(DeviceEvent::DeviceTxStatusChanged {
            key: self.session.key(),
            status: text.to_string(),
        });
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.session.set_blocked(blocked);
    }

    /// Race `future` against cancellation
    pub async fn run<F, T>(&self, future: F) -> HwResult<T>
    where
        F: Future<Output = HwResult<T>>,
    {
        let token = self.token.clone();
        tokio::select! {
            _ = token.cancelled() => Err(HwError::Cancelled),
            result = future => result,
        }
    }

    async fn next_prompt(&mut self, kind: PromptKind, event: DeviceEvent) -> HwResult<PromptReply> {
        *self.session.awaiting.lock() = Some(kind);
        self.session.set_blocked(true);
        self.session.emit(event);

        let token = self.token.clone();
        let reply = tokio::select! {
            _ = token.cancelled() => Err(HwError::Cancelled),
            reply = self.prompts.recv() => reply.ok_or(HwError::Cancelled),
        };

        *self.session.awaiting.lock() = None;
        self.session.set_blocked(false);
        reply
    }

    pub async fn wait_pin(&mut self) -> HwResult<SecretString> {
        self.set_status(status::ENTER_PIN);
        let event = DeviceEvent::RequestPinMatrix(self.session.key());
        match self.next_prompt(PromptKind::Pin, event).await? {
            PromptReply::Pin(pin) => Ok(pin),
            PromptReply::Passphrase { .. } => Err(HwError::Internal("expected a PIN reply".into())),
        }
    }

    /// Returns the passphrase and whether it should be entered on the device
    pub async fn wait_passphrase(&mut self, allowed_on_device: bool) -> HwResult<(SecretString, bool)> {
        self.set_status(status::ENTER_PASSPHRASE);
        let event = DeviceEvent::RequestHwPass { key: self.session.key(), allowed_on_device };
        match self.next_prompt(PromptKind::Passphrase, event).await? {
            PromptReply::Passphrase { passphrase, on_device } => Ok((passphrase, on_device && allowed_on_device)),
            PromptReply::Pin(_) => Err(HwError::Internal("expected a passphrase reply".into())),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        debug!(operation = self.name, "operation finished, resetting session state");
        self.session.reset();
    }
}

/// Shared handle to one live device
#[derive(Clone)]
pub struct DeviceHandle {
    session: Arc<DeviceSession>,
    device: Arc<tokio::sync::Mutex<Box<dyn DeviceInterface>>>,
    timeout: Duration,
}

type DeviceGuard = tokio::sync::OwnedMutexGuard<Box<dyn DeviceInterface>>;

impl DeviceHandle {
    pub fn new(device: Box<dyn DeviceInterface>, timeout: Duration) -> Self {
        let session = Arc::clone(device.session());
        Self { session, device: Arc::new(tokio::sync::Mutex::new(device)), timeout }
    }

    pub fn key(&self) -> DeviceKey {
        self.session.key()
    }

    pub fn device_type(&self) -> DeviceType {
        self.session.key().device_type
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn is_blocked(&self) -> bool {
        self.session.is_blocked()
    }

    pub fn last_error(&self) -> Option<String> {
        self.session.last_error()
    }

    pub fn cancel(&self) {
        self.session.cancel();
    }

    pub fn set_matrix_pin(&self, pin: SecretString) -> HwResult<()> {
        self.session.submit_prompt(PromptReply::Pin(pin))
    }

    pub fn set_passphrase(&self, passphrase: SecretString, on_device: bool) -> HwResult<()> {
        self.session.submit_prompt(PromptReply::Passphrase { passphrase, on_device })
    }

    fn acquire(&self, name: &'static str) -> HwResult<(DeviceGuard, OperationGuard)> {
        let op = self.session.begin(name)?;
        let device = Arc::clone(&self.device)
            .try_lock_owned()
            .map_err(|_| HwError::DeviceBusy)?;
        Ok((device, op))
    }

    fn limit(&self, name: &'static str) -> TimeoutConfig {
        TimeoutConfig::new(self.timeout, name)
    }

    fn finish<T>(&self, name: &'static str, result: HwResult<T>) -> HwResult<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let key = self.session.key();
        match &err {
            HwError::DeviceBusy => return Err(err),
            HwError::Cancelled => info!(device = %key, operation = name, "operation cancelled"),
            HwError::CancelledOnDevice => {
                info!(device = %key, operation = name, "operation declined on device");
                self.session.emit(DeviceEvent::CancelledOnDevice(key.clone()));
            }
            HwError::InvalidPin => {
                warn!(device = %key, operation = name, "device rejected the PIN");
                self.session.emit(DeviceEvent::InvalidPin(key.clone()));
            }
            other => {
                error!(device = %key, operation = name, "operation failed: {}", other);
                self.session.emit(DeviceEvent::OperationFailed {
                    key: key.clone(),
                    reason: other.reason(),
                });
                if other.requires_rescan() {
                    self.session.emit(DeviceEvent::RequestForRescan(key.clone()));
                }
            }
        }
        self.session.record_error(err.reason());
        Err(err)
    }

    pub async fn init(&self) -> HwResult<()> {
        let (mut device, mut op) = self.acquire("init")?;
        let timer = OperationTimer::start("init");
        let result = execute_with_timeout(device.init(&mut op), self.limit("init")).await;
        timer.finish();
        self.finish("init", result)
    }

    pub async fn clear_session(&self) -> HwResult<()> {
        let (mut device, mut op) = self.acquire("clear_session")?;
        let timer = OperationTimer::start("clear_session");
        let result = execute_with_timeout(device.clear_session(&mut op), self.limit("clear_session")).await;
        timer.finish();
        self.finish("clear_session", result)
    }

    pub async fn get_public_keys(&self) -> HwResult<HwWalletInfo> {
        let (mut device, mut op) = self.acquire("get_public_keys")?;
        let timer = OperationTimer::start("get_public_keys");
        let result = execute_with_timeout(device.get_public_keys(&mut op), self.limit("get_public_keys")).await;
        timer.finish();
        self.finish("get_public_keys", result)
    }

    pub async fn sign_tx(&self, req: &TxSignRequest) -> HwResult<Vec<u8>> {
        let (mut device, mut op) = self.acquire("sign_tx")?;
        let timer = OperationTimer::start("sign_tx");
        let result = execute_with_timeout(device.sign_tx(&mut op, req), self.limit("sign_tx")).await;
        timer.finish();
        self.finish("sign_tx", result)
    }

    pub async fn retrieve_xpub_root(&self) -> HwResult<String> {
        let (mut device, mut op) = self.acquire("retrieve_xpub_root")?;
        let timer = OperationTimer::start("retrieve_xpub_root");
        let result = execute_with_timeout(device.retrieve_xpub_root(&mut op), self.limit("retrieve_xpub_root")).await;
        timer.finish();
        self.finish("retrieve_xpub_root", result)
    }

    /// Drop the transport; waits for an in-flight operation to be cancelled
    pub async fn release(&self) -> HwResult<()> {
        self.session.cancel();
        let mut device = self.device.lock().await;
        device.release().await
    }
}
