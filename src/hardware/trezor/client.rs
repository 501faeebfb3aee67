//! Trezor discovery through the bridge
//!
//! State machine: `None -> Init -> Enumerated -> Acquired -> Released`.

use super::bridge::{BridgeClient, BridgeRequest, HttpBridge};
use super::device::{TrezorDevice, TREZOR_VENDOR};
use crate::core::config::HwConfig;
use crate::core::errors::HwResult;
use crate::core::types::{DeviceKey, DeviceType};
use crate::hardware::events::DeviceCallbacks;
use crate::hardware::session::{DeviceHandle, DeviceSession};
use crate::hardware::DeviceClient;
use crate::tools::worker_pool::{Worker, WorkerPool};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    None,
    Init,
    Enumerated,
    Acquired,
    Released,
}

pub struct TrezorClient {
    config: HwConfig,
    bridge: BridgeClient,
    callbacks: Arc<dyn DeviceCallbacks>,
    state: Mutex<ClientState>,
    devices: RwLock<Vec<DeviceHandle>>,
}

impl TrezorClient {
    /// Talks to the bridge over HTTP. Must be called inside a tokio runtime.
    pub fn new(config: &HwConfig, callbacks: Arc<dyn DeviceCallbacks>) -> Self {
        Self::with_worker(config, Arc::new(HttpBridge::new(&config.trezor)), callbacks)
    }

    pub fn with_worker(
        config: &HwConfig,
        worker: Arc<dyn Worker<BridgeRequest, HwResult<String>>>,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Self {
        let pool = WorkerPool::new(
            "trezor-bridge",
            config.workers.pool_size,
            config.workers.queue_depth,
            worker,
        );
        Self {
            config: config.clone(),
            bridge: BridgeClient::new(Arc::new(pool), &config.trezor),
            callbacks,
            state: Mutex::new(ClientState::None),
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn bridge(&self) -> &BridgeClient {
        &self.bridge
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Check the bridge is up, returns its version
    pub async fn init_connection(&self) -> HwResult<String> {
        info!("Initialize Trezor bridge connection");
        let version = self.bridge.version().await?;
        self.set_state(ClientState::Init);
        Ok(version)
    }

    async fn open_device(&self, path: &str, previous: Option<&str>) -> HwResult<DeviceHandle> {
        let bridge_session = self.bridge.acquire(path, previous).await?;
        let key = DeviceKey::new(DeviceType::Trezor, path, "Trezor", TREZOR_VENDOR);
        let session = DeviceSession::new(key, Arc::clone(&self.callbacks));
        let device = TrezorDevice::new(
            session,
            self.bridge.clone(),
            path,
            bridge_session,
            self.config.testnet,
        );
        let handle = DeviceHandle::new(Box::new(device), self.config.operation_timeout());
        if let Err(e) = handle.init().await {
            if let Err(release_err) = handle.release().await {
                warn!(path, "failed to release Trezor after init error: {}", release_err);
            }
            return Err(e);
        }
        Ok(handle)
    }
}

#[async_trait]
impl DeviceClient for TrezorClient {
    fn device_type(&self) -> DeviceType {
        DeviceType::Trezor
    }

    async fn scan_devices(&self) -> HwResult<Vec<DeviceKey>> {
        self.release_all().await;
        self.init_connection().await?;

        let found = self.bridge.enumerate().await?;
        self.set_state(ClientState::Enumerated);
        if found.is_empty() {
            info!("No Trezor device available");
            return Ok(Vec::new());
        }
        info!("Bridge reports {} Trezor device(s), acquiring", found.len());

        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        // Acquisitions are chained, the bridge hands out sessions one at a time
        for entry in found {
            let handle = match self.open_device(&entry.path, entry.session.as_deref()).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(path = %entry.path, "skipping Trezor: {}", e);
                    continue;
                }
            };
            if !seen.insert(handle.key().id) {
                warn!(path = %entry.path, "duplicate Trezor id, releasing");
                if let Err(e) = handle.release().await {
                    warn!(path = %entry.path, "failed to release duplicate: {}", e);
                }
                continue;
            }
            handles.push(handle);
        }

        if !handles.is_empty() {
            self.set_state(ClientState::Acquired);
        }
        let keys: Vec<DeviceKey> = handles.iter().map(DeviceHandle::key).collect();
        info!("✅ {} Trezor device(s) ready", keys.len());
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
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.release().await {
                warn!(device = %handle.key(), "failed to release Trezor: {}", e);
            }
        }
        self.set_state(ClientState::Released);
    }
}
