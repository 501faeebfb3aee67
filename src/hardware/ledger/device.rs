//! Ledger device driver
//!
//! The HID handle is opened lazily and dropped whenever an operation fails,
//! so the next operation starts from a fresh transport.

use super::apdu::ApduCommand;
use super::bitcoin_app::{ApduExchange, LedgerBitcoinApp};
use super::transport::{ApduJob, HidDeviceInfo, HidEnumerator, LedgerModel, SharedTransport};
use super::ApduPool;
use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::tx_request::TxSignRequest;
use crate::core::types::{status, DeviceType, HwWalletInfo};
use crate::core::wallet::compute_wallet_id;
use crate::hardware::session::{DeviceSession, OperationGuard};
use crate::hardware::DeviceInterface;
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runs APDUs on the worker pool, aborting on cancellation
struct PooledChannel {
    pool: Arc<ApduPool>,
    transport: SharedTransport,
    token: CancellationToken,
}

#[async_trait]
impl ApduExchange for PooledChannel {
    async fn exchange(&mut self, command: ApduCommand) -> HwResult<Vec<u8>> {
        let job = ApduJob { transport: Arc::clone(&self.transport), command };
        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(HwError::Cancelled),
            response = self.pool.submit(job) => response??,
        };
        response.check()
    }
}

pub struct LedgerDevice {
    session: Arc<DeviceSession>,
    info: HidDeviceInfo,
    model: LedgerModel,
    enumerator: Arc<dyn HidEnumerator>,
    pool: Arc<ApduPool>,
    transport: Option<SharedTransport>,
    read_timeout: Duration,
    testnet: bool,
    firmware: Option<String>,
}

impl LedgerDevice {
    pub fn new(
        session: Arc<DeviceSession>,
        info: HidDeviceInfo,
        model: LedgerModel,
        enumerator: Arc<dyn HidEnumerator>,
        pool: Arc<ApduPool>,
        read_timeout: Duration,
        testnet: bool,
    ) -> Self {
        Self {
            session,
            info,
            model,
            enumerator,
            pool,
            transport: None,
            read_timeout,
            testnet,
            firmware: None,
        }
    }

    pub fn model(&self) -> LedgerModel {
        self.model
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    fn open(&mut self) -> HwResult<SharedTransport> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        debug!(path = %self.info.path, "opening Ledger HID handle");
        let transport = Arc::new(Mutex::new(self.enumerator.open(&self.info, self.read_timeout)?));
        self.transport = Some(Arc::clone(&transport));
        Ok(transport)
    }

    fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            debug!(path = %self.info.path, "releasing Ledger HID handle");
            // An exchange still running on the pool keeps its own reference
            if let Some(mut guard) = transport.try_lock() {
                guard.close();
            }
        }
    }

    fn app(&mut self, op: &OperationGuard) -> HwResult<LedgerBitcoinApp<PooledChannel>> {
        let channel = PooledChannel {
            pool: Arc::clone(&self.pool),
            transport: self.open()?,
            token: op.token(),
        };
        Ok(LedgerBitcoinApp::new(channel, self.testnet))
    }

    /// Release the handle after any failure
    fn settle<T>(&mut self, result: HwResult<T>) -> HwResult<T> {
        if let Err(e) = &result {
            warn!(device = %self.info.device_id(), "Ledger operation failed: {}", e);
            self.close();
        }
        result
    }

    async fn xpub(&mut self, op: &OperationGuard, path: Bip32Path) -> HwResult<String> {
        let result = match self.app(op) {
            Ok(mut app) => app.get_xpub(&path).await,
            Err(e) => Err(e),
        };
        self.settle(result)
    }
}

#[async_trait]
impl DeviceInterface for LedgerDevice {
    fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Ledger
    }

    async fn init(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        if self.transport.is_some() && self.firmware.is_some() {
            return Ok(());
        }
        let result = match self.app(op) {
            Ok(mut app) => app.firmware_version().await,
            Err(e) => Err(e),
        };
        let version = self.settle(result)?;
        info!("✅ Ledger {} ready, Bitcoin app {}", self.model.label(), version);
        self.firmware = Some(version);
        self.session.update_key(|key| key.status = status::READY.to_string());
        Ok(())
    }

    async fn clear_session(&mut self, _op: &mut OperationGuard) -> HwResult<()> {
        self.close();
        self.firmware = None;
        Ok(())
    }

    #[instrument(skip_all, fields(device = %self.info.device_id()))]
    async fn get_public_keys(&mut self, op: &mut OperationGuard) -> HwResult<HwWalletInfo> {
        let key = self.session.key();
        let xpub_root = self.xpub(op, Bip32Path::root()).await?;
        let xpub_legacy = self.xpub(op, Bip32Path::account(Purpose::NonSegWit, self.testnet)).await?;
        let xpub_nested_segwit = self.xpub(op, Bip32Path::account(Purpose::Nested, self.testnet)).await?;
        let xpub_native_segwit = self.xpub(op, Bip32Path::account(Purpose::Native, self.testnet)).await?;
        info!("public keys exported");

        Ok(HwWalletInfo {
            wallet_type: DeviceType::Ledger,
            label: key.label,
            vendor: key.vendor,
            device_id: key.id,
            xpub_root,
            xpub_legacy,
            xpub_nested_segwit,
            xpub_native_segwit,
        })
    }

    #[instrument(skip_all, fields(device = %self.info.device_id(), inputs = req.inputs.len()))]
    async fn sign_tx(&mut self, op: &mut OperationGuard, req: &TxSignRequest) -> HwResult<Vec<u8>> {
        let result = match self.app(op) {
            Ok(mut app) => app.sign_transaction(op, req).await,
            Err(e) => Err(e),
        };
        let tx = self.settle(result)?;
        op.set_status(status::READY);
        info!(txid = %tx.txid(), "✅ transaction signed");
        Ok(serialize(&tx))
    }

    async fn retrieve_xpub_root(&mut self, op: &mut OperationGuard) -> HwResult<String> {
        let xpub = self.xpub(op, Bip32Path::root()).await?;
        let wallet_id = compute_wallet_id(&xpub)?;
        self.session.update_key(|key| key.wallet_id = wallet_id);
        Ok(xpub)
    }

    async fn release(&mut self) -> HwResult<()> {
        self.close();
        self.firmware = None;
        Ok(())
    }
}
