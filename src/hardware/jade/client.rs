//! Jade discovery over USB serial

use super::device::{JadeDevice, JADE_LABEL, JADE_VENDOR};
#[cfg(not(feature = "jade"))]
use super::transport::NoSerial;
use super::transport::{JadePort, JadePortScanner};
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

pub struct JadeClient {
    config: HwConfig,
    scanner: Arc<dyn JadePortScanner>,
    callbacks: Arc<dyn DeviceCallbacks>,
    devices: RwLock<Vec<DeviceHandle>>,
}

impl JadeClient {
    /// Uses tokio-serial when compiled with the `jade` feature
    pub fn new(config: &HwConfig, callbacks: Arc<dyn DeviceCallbacks>) -> Self {
        #[cfg(feature = "jade")]
        let scanner: Arc<dyn JadePortScanner> =
            Arc::new(super::transport::SerialScanner::new(config.jade.baud_rate));
        #[cfg(not(feature = "jade"))]
        let scanner: Arc<dyn JadePortScanner> = Arc::new(NoSerial);
        Self::with_scanner(config, scanner, callbacks)
    }

    pub fn with_scanner(
        config: &HwConfig,
        scanner: Arc<dyn JadePortScanner>,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        Self {
            config: config.clone(),
            scanner,
            callbacks,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Open the port and read its version info
    async fn open_and_identify(&self, port: JadePort) -> HwResult<DeviceHandle> {
        let mut key = DeviceKey::new(DeviceType::Jade, port.port.clone(), JADE_LABEL, JADE_VENDOR);
        key.status = status::NOT_INITED.to_string();
        let session = DeviceSession::new(key, Arc::clone(&self.callbacks));
        let device = JadeDevice::new(
            session,
            port,
            Arc::clone(&self.scanner),
            self.config.jade.request_timeout(),
            self.config.testnet,
        );
        let handle = DeviceHandle::new(Box::new(device), self.config.operation_timeout());
        if let Err(e) = handle.init().await {
            if let Err(release_err) = handle.release().await {
                warn!("failed to close Jade after identify error: {}", release_err);
            }
            return Err(e);
        }
        Ok(handle)
    }
}

#[async_trait]
impl DeviceClient for JadeClient {
    fn device_type(&self) -> DeviceType {
        DeviceType::Jade
    }

    async fn scan_devices(&self) -> HwResult<Vec<DeviceKey>> {
        self.release_all().await;

        let scanner = Arc::clone(&self.scanner);
        let ports = tokio::task::spawn_blocking(move || scanner.list_ports())
            .await
            .map_err(|e| HwError::Internal(format!("serial enumeration task failed: {}", e)))??;

        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        for port in ports.into_iter().filter(JadePort::is_jade) {
            let name = port.port.clone();
            debug!(port = %name, "probing Jade");
            let handle = match self.open_and_identify(port).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(port = %name, "skipping Jade: {}", e);
                    continue;
                }
            };
            if !seen.insert(handle.key().id) {
                warn!(port = %name, "duplicate Jade id, closing");
                if let Err(e) = handle.release().await {
                    warn!(port = %name, "failed to close duplicate: {}", e);
                }
                continue;
            }
            handles.push(handle);
        }

        let keys: Vec<DeviceKey> = handles.iter().map(DeviceHandle::key).collect();
        info!("Found {} Jade device(s)", keys.len());
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
                warn!(device = %handle.key(), "failed to close Jade: {}", e);
            }
        }
    }
}
