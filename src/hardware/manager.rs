//! Device manager
//!
//! Owns one client per device family and routes every request by
//! `(device_type, id)`. It keeps no per-device state besides the last scan
//! result; handles live in the clients.

use crate::core::config::HwConfig;
use crate::core::errors::{HwError, HwResult};
use crate::core::tx_request::TxSignRequest;
use crate::core::types::{DeviceKey, DeviceType, HwWalletInfo};
use crate::core::wallet::{compute_wallet_id, WalletsProvider};
use crate::hardware::events::{DeviceCallbacks, DeviceEvent};
use crate::hardware::jade::JadeClient;
use crate::hardware::ledger::LedgerClient;
use crate::hardware::session::DeviceHandle;
use crate::hardware::trezor::TrezorClient;
use crate::hardware::DeviceClient;
use futures::future::join_all;
use parking_lot::RwLock;
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Clears the scan flag on every exit path
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn try_new(flag: &'a AtomicBool) -> HwResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| HwError::ScanInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Keep the first key per `(type, id)`
pub fn dedupe_keys(keys: impl IntoIterator<Item = DeviceKey>) -> Vec<DeviceKey> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert((key.device_type, key.id.clone())))
        .collect()
}

pub struct DeviceManager {
    testnet: bool,
    clients: Vec<Arc<dyn DeviceClient>>,
    wallets: Arc<dyn WalletsProvider>,
    callbacks: Arc<dyn DeviceCallbacks>,
    scanning: AtomicBool,
    devices: RwLock<Vec<DeviceKey>>,
}

impl DeviceManager {
    /// Trezor, Ledger and Jade clients with their production transports.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: &HwConfig,
        wallets: Arc<dyn WalletsProvider>,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        let clients: Vec<Arc<dyn DeviceClient>> = vec![
            Arc::new(TrezorClient::new(config, Arc::clone(&callbacks))),
            Arc::new(LedgerClient::new(config, Arc::clone(&callbacks))),
            Arc::new(JadeClient::new(config, Arc::clone(&callbacks))),
        ];
        Self::with_clients(config, clients, wallets, callbacks)
    }

    pub fn with_clients(
        config: &HwConfig,
        clients: Vec<Arc<dyn DeviceClient>>,
        wallets: Arc<dyn WalletsProvider>,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        Self {
            testnet: config.testnet,
            clients,
            wallets,
            callbacks,
            scanning: AtomicBool::new(false),
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn testnet(&self) -> bool {
        self.testnet
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Keys of the last completed scan
    pub fn devices(&self) -> Vec<DeviceKey> {
        self.devices.read().clone()
    }

    fn publish(&self) -> Vec<DeviceKey> {
        let keys = dedupe_keys(self.clients.iter().flat_map(|client| client.device_keys()));
        info!("✅ Device scan complete, {} device(s)", keys.len());
        *self.devices.write() = keys.clone();
        self.callbacks.on_event(DeviceEvent::DevicesChanged(keys.clone()));
        keys
    }

    /// Rescan every family in parallel
    ///
    /// A family that fails to scan is logged and contributes no device.
    /// `DevicesChanged` is emitted once, after the last family reports.
    #[instrument(skip_all)]
    pub async fn scan_devices(&self) -> HwResult<Vec<DeviceKey>> {
        let _guard = ScanGuard::try_new(&self.scanning)?;
        info!("Scanning {} device families", self.clients.len());

        let remaining = AtomicUsize::new(self.clients.len());
        if self.clients.is_empty() {
            return Ok(self.publish());
        }

        let scans = self.clients.iter().map(|client| {
            let remaining = &remaining;
            async move {
                let device_type = client.device_type();
                match client.scan_devices().await {
                    Ok(keys) => debug!(%device_type, found = keys.len(), "family scan finished"),
                    Err(e) => warn!(%device_type, "family scan failed: {}", e),
                }
                // last one out publishes
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    Some(self.publish())
                } else {
                    None
                }
            }
        });
        let published = join_all(scans).await.into_iter().flatten().next();
        published.ok_or_else(|| HwError::Internal("device scan finished without a result".into()))
    }

    /// Rescan a single family, devices of other families stay untouched
    async fn rescan_family(&self, client: &Arc<dyn DeviceClient>) -> HwResult<()> {
        let _guard = ScanGuard::try_new(&self.scanning)?;
        let device_type = client.device_type();
        match client.scan_devices().await {
            Ok(keys) => debug!(%device_type, found = keys.len(), "family rescan finished"),
            Err(e) => warn!(%device_type, "family rescan failed: {}", e),
        }
        self.publish();
        Ok(())
    }

    /// Client of one family; `None` is not routable
    pub fn get_device(&self, device_type: DeviceType) -> HwResult<Arc<dyn DeviceClient>> {
        if device_type == DeviceType::None {
            return Err(HwError::UnsupportedDeviceType(device_type.to_string()));
        }
        self.clients
            .iter()
            .find(|client| client.device_type() == device_type)
            .cloned()
            .ok_or_else(|| HwError::UnsupportedDeviceType(device_type.to_string()))
    }

    pub fn handle(&self, key: &DeviceKey) -> HwResult<DeviceHandle> {
        self.get_device(key.device_type)?
            .device(&key.id)
            .ok_or_else(|| HwError::DeviceNotFound(format!("{}:{}", key.device_type, key.id)))
    }

    /// Find the attached device a hardware wallet was created with.
    /// Emits `DeviceReady` or `DeviceNotFound` with the wallet id.
    #[instrument(skip(self))]
    pub async fn prepare_device_for_sign(&self, wallet_id: &str) -> HwResult<Option<DeviceKey>> {
        let wallet = self
            .wallets
            .wallet_by_id(wallet_id)
            .ok_or_else(|| HwError::InvalidRequest(format!("unknown wallet {}", wallet_id)))?;
        let Some(binding) = wallet.hw_encryption() else {
            warn!("wallet is not a hardware wallet");
            self.callbacks.on_event(DeviceEvent::DeviceNotFound(wallet_id.to_string()));
            return Ok(None);
        };

        let client = self.get_device(binding.device_type)?;

        let mut found = None;
        if binding.device_type == DeviceType::Ledger {
            // Ledger exposes no stable id, match on the root key instead
            self.rescan_family(&client).await?;
            for key in client.device_keys() {
                let Some(handle) = client.device(&key.id) else { continue };
                match handle.retrieve_xpub_root().await.and_then(|xpub| compute_wallet_id(&xpub)) {
                    Ok(id) if id == wallet_id => {
                        found = Some(handle);
                        break;
                    }
                    Ok(id) => debug!(device = %key, other = %id, "Ledger holds another wallet"),
                    Err(e) => warn!(device = %key, "cannot read root key: {}", e),
                }
            }
        } else {
            found = client.device(&binding.device_id);
            if found.is_none() {
                self.rescan_family(&client).await?;
                found = client.device(&binding.device_id);
            }
        }

        match found {
            Some(handle) => {
                handle.session().update_key(|key| key.wallet_id = wallet_id.to_string());
                let key = handle.key();
                info!(device = %key, "✅ device ready for signing");
                *self.devices.write() = dedupe_keys(self.clients.iter().flat_map(|c| c.device_keys()));
                self.callbacks.on_event(DeviceEvent::DeviceReady(wallet_id.to_string()));
                Ok(Some(key))
            }
            None => {
                info!(device_type = %binding.device_type, "no attached device holds the wallet");
                self.callbacks.on_event(DeviceEvent::DeviceNotFound(wallet_id.to_string()));
                Ok(None)
            }
        }
    }

    /// Like `handle`, but reports a missing device through the callbacks
    fn route(&self, key: &DeviceKey) -> HwResult<DeviceHandle> {
        self.handle(key).map_err(|e| {
            if let HwError::DeviceNotFound(_) = e {
                warn!(device = %key, "device is not attached");
                self.callbacks.on_event(DeviceEvent::DeviceNotFound(key.id.clone()));
            }
            e
        })
    }

    pub async fn get_public_keys(&self, key: &DeviceKey) -> HwResult<HwWalletInfo> {
        let handle = self.route(key)?;
        let info = handle.get_public_keys().await?;
        self.callbacks.on_event(DeviceEvent::PublicKeyReady(info.clone()));
        Ok(info)
    }

    pub async fn retrieve_xpub_root(&self, key: &DeviceKey) -> HwResult<String> {
        self.route(key)?.retrieve_xpub_root().await
    }

    /// Resolve input indices, sign and emit `TxSigned`
    #[instrument(skip_all, fields(device = %key))]
    pub async fn sign_tx(&self, key: &DeviceKey, mut req: TxSignRequest) -> HwResult<Vec<u8>> {
        let handle = self.route(key)?;
        if let Err(e) = req.resolve_input_indices(self.wallets.as_ref()) {
            warn!("cannot resolve input addresses: {}", e);
            self.callbacks.on_event(DeviceEvent::OperationFailed { key: handle.key(), reason: e.reason() });
            return Err(e);
        }
        let signed = handle.sign_tx(&req).await?;
        self.callbacks.on_event(DeviceEvent::TxSigned(signed.clone()));
        Ok(signed)
    }

    pub fn set_matrix_pin(&self, key: &DeviceKey, pin: SecretString) -> HwResult<()> {
        self.handle(key)?.set_matrix_pin(pin)
    }

    pub fn set_passphrase(&self, key: &DeviceKey, passphrase: SecretString, on_device: bool) -> HwResult<()> {
        self.handle(key)?.set_passphrase(passphrase, on_device)
    }

    /// No-op for unknown or idle devices
    pub fn cancel(&self, key: &DeviceKey) {
        match self.handle(key) {
            Ok(handle) => handle.cancel(),
            Err(e) => debug!(device = %key, "nothing to cancel: {}", e),
        }
    }

    pub async fn release_devices(&self) {
        join_all(self.clients.iter().map(|client| client.release_all())).await;
        self.devices.write().clear();
        info!("All devices released");
    }
}
