//! Ledger discovery

use super::device::LedgerDevice;
use super::transport::{classify, ApduWorker, HidEnumerator, NoHid};
use super::ApduPool;
use crate::core::config::HwConfig;
use crate::core::errors::{HwError, HwResult};
use crate::core::types::{status, DeviceKey, DeviceType};
use crate::hardware::events::DeviceCallbacks;
use crate::hardware::session::{DeviceHandle, DeviceSession};
use crate::hardware::DeviceClient;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LEDGER_VENDOR: &str = "Ledger";

pub struct LedgerClient {
    config: HwConfig,
    enumerator: Arc<dyn HidEnumerator>,
    pool: Arc<ApduPool>,
    callbacks: Arc<dyn DeviceCallbacks>,
    devices: RwLock<Vec<DeviceHandle>>,
}

impl LedgerClient {
    /// Uses hidapi when compiled with the `ledger` feature.
    /// Must be called inside a tokio runtime.
    pub fn new(config: &HwConfig, callbacks: Arc<dyn DeviceCallbacks>) -> Self {
        #[cfg(feature = "ledger")]
        let enumerator: Arc<dyn HidEnumerator> =
            Arc::new(super::transport::HidApiEnumerator::new(super::transport::HidBus::new()));
        #[cfg(not(feature = "ledger"))]
        let enumerator: Arc<dyn HidEnumerator> = Arc::new(NoHid);
        Self::with_enumerator(config, enumerator, callbacks)
    }

    pub fn with_enumerator(
        config: &HwConfig,
        enumerator: Arc<dyn HidEnumerator>,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        let pool = ApduPool::new(
            "ledger-apdu",
            config.workers.pool_size,
            config.workers.queue_depth,
            Arc::new(ApduWorker),
        );
        Self {
            config: config.clone(),
            enumerator,
            pool: Arc::new(pool),
            callbacks,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Client with HID disabled
    pub fn disabled(config: &HwConfig, callbacks: Arc<dyn DeviceCallbacks>) -> Self {
        Self::with_enumerator(config, Arc::new(NoHid), callbacks)
    }
}

#[async_trait]
impl DeviceClient for LedgerClient {
    fn device_type(&self) -> DeviceType {
        DeviceType::Ledger
    }

    async fn scan_devices(&self) -> HwResult<Vec<DeviceKey>> {
        self.release_all().await;

        let enumerator = Arc::clone(&self.enumerator);
        let found = tokio::task::spawn_blocking(move || enumerator.enumerate())
            .await
            .map_err(|e| HwError::Internal(format!("HID enumeration task failed: {}", e)))??;

        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        for info in found {
            let Some(model) = classify(&info) else {
                continue;
            };
            let id = info.device_id();
            if !seen.insert(id.clone()) {
                debug!(id = %id, "skipping duplicate HID interface");
                continue;
            }

            let mut key = DeviceKey::new(DeviceType::Ledger, id, model.label(), LEDGER_VENDOR);
            key.status = status::NOT_INITED.to_string();
            let session = DeviceSession::new(key, Arc::clone(&self.callbacks));
            let device = LedgerDevice::new(
                session,
                info,
                model,
                Arc::clone(&self.enumerator),
                Arc::clone(&self.pool),
                self.config.ledger.read_timeout(),
                self.config.testnet,
            );
            handles.push(DeviceHandle::new(Box::new(device), self.config.operation_timeout()));
        }

        let keys: Vec<DeviceKey> = handles.iter().map(DeviceHandle::key).collect();
        info!("Found {} Ledger device(s)", keys.len());
        *self.devices.write() = handles;
        Ok(keys)
    }

    fn device_keys(&self) -> Vec<DeviceKey> {
        self.devices.read().iter().map(DeviceHandle::key).collect()
    }

    fn device(&self, id: &str) -> Option<DeviceHandle> {
        self.devices.read().iter().find(|d| d.key().id == id).cloned()
    }

    async fn release_all(&self) {
        let handles: Vec<DeviceHandle> = std::mem::take(&mut *self.devices.write());
        for handle in handles {
            if let Err(e) = handle.release().await {
                warn!(device = %handle.key(), "failed to release Ledger: {}", e);
            }
        }
    }
}
