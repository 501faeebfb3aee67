//! Jade device driver

use super::messages::{
    expect_bytes, expect_text, network, AuthUserParams, CborBytes, ChangeInfo, GetXpubParams,
    JadeState, SignTxParams, TxInputParams, VersionInfo,
};
use super::transport::{JadePort, JadePortScanner, JadeRpc};
use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::signing::{finalize_transaction, verify_signed_transaction, InputSignature};
use crate::core::tx_request::{p2pkh_script, SigningInput, TxSignRequest};
use crate::core::types::{status, DeviceType, HwWalletInfo};
use crate::core::wallet::compute_wallet_id;
use crate::hardware::session::{DeviceSession, OperationGuard};
use crate::hardware::DeviceInterface;
use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::{ecdsa, Secp256k1};
use ciborium::value::Value;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

pub const JADE_VENDOR: &str = "Blockstream";
pub const JADE_LABEL: &str = "Jade";

/// Descriptor variant Jade expects for a change output
pub fn change_variant(purpose: Purpose) -> &'static str {
    match purpose {
        Purpose::Native => "wpkh(k)",
        Purpose::Nested => "sh(wpkh(k))",
        Purpose::NonSegWit => "pkh(k)",
    }
}

/// DER with the sighash byte appended. Jade firmware differs on whether the
/// byte is already there.
pub fn normalize_signature(mut signature: Vec<u8>) -> HwResult<Vec<u8>> {
    if ecdsa::Signature::from_der(&signature).is_ok() {
        signature.push(0x01);
        return Ok(signature);
    }
    match signature.split_last() {
        Some((&0x01, der)) if ecdsa::Signature::from_der(der).is_ok() => Ok(signature),
        _ => Err(HwError::Protocol(format!(
            "Jade returned a malformed signature: {}",
            hex::encode(&signature)
        ))),
    }
}

/// One `change` entry per output, only our change output is described
pub fn change_entries(req: &TxSignRequest, testnet: bool) -> HwResult<Vec<Option<ChangeInfo>>> {
    let mut entries: Vec<Option<ChangeInfo>> = vec![None; req.recipients.len()];
    if let Some((purpose, path)) = req.change_path(testnet)? {
        entries.push(Some(ChangeInfo { path: path.path, variant: change_variant(purpose) }));
    }
    Ok(entries)
}

fn unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct JadeDevice {
    session: Arc<DeviceSession>,
    port: JadePort,
    scanner: Arc<dyn JadePortScanner>,
    rpc: Option<JadeRpc>,
    info: Option<VersionInfo>,
    authenticated: bool,
    request_timeout: Duration,
    testnet: bool,
}

impl JadeDevice {
    pub fn new(
        session: Arc<DeviceSession>,
        port: JadePort,
        scanner: Arc<dyn JadePortScanner>,
        request_timeout: Duration,
        testnet: bool,
    ) -> Self {
        Self {
            session,
            port,
            scanner,
            rpc: None,
            info: None,
            authenticated: false,
            request_timeout,
            testnet,
        }
    }

    pub fn port(&self) -> &JadePort {
        &self.port
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        self.info.as_ref()
    }

    fn network(&self) -> &'static str {
        network(self.testnet)
    }

    async fn ensure_open(&mut self) -> HwResult<()> {
        match self.rpc.as_ref().map(JadeRpc::is_clean) {
            Some(true) => {
                // leftovers of an operation that was dropped mid-request
                if let Some(rpc) = self.rpc.as_mut() {
                    rpc.abandon();
                }
                return Ok(());
            }
            Some(false) => {
                warn!(port = %self.port.port, "Jade stream out of sync, reopening");
                self.close().await;
            }
            None => {}
        }
        let stream = self.scanner.open(&self.port).await?;
        self.rpc = Some(JadeRpc::new(stream, self.request_timeout));
        debug!(port = %self.port.port, "Jade connection opened");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut rpc) = self.rpc.take() {
            rpc.close().await;
        }
        self.authenticated = false;
    }

    /// Drop or resync the connection after a failed request
    async fn settle(&mut self, err: &HwError) {
        let keep = match err {
            HwError::Cancelled | HwError::Timeout(_) => {
                self.rpc.as_mut().map_or(false, JadeRpc::abandon)
            }
            HwError::Transport(_) => false,
            _ => true,
        };
        if !keep {
            self.close().await;
        }
    }

    fn channel(&mut self) -> HwResult<&mut JadeRpc> {
        self.rpc
            .as_mut()
            .ok_or_else(|| HwError::Transport(format!("Jade at {} is not open", self.port.port)))
    }

    async fn call<P>(&mut self, op: &mut OperationGuard, method: &str, params: Option<&P>) -> HwResult<Value>
    where
        P: Serialize + Sync,
    {
        self.ensure_open().await?;
        let rpc = self.channel()?;
        let result = op.run(rpc.request(method, params)).await;
        if let Err(e) = &result {
            debug!(method, "Jade request failed: {}", e);
            self.settle(e).await;
        }
        result
    }

    /// Send every request before reading replies, Jade answers in order
    async fn call_batch<P>(&mut self, op: &mut OperationGuard, method: &str, params: &[P]) -> HwResult<Vec<Value>>
    where
        P: Serialize + Sync,
    {
        self.ensure_open().await?;
        let rpc = self.channel()?;
        let batch = async move {
            let mut ids = Vec::with_capacity(params.len());
            for param in params {
                ids.push(rpc.send(method, Some(param)).await?);
            }
            let mut replies = Vec::with_capacity(ids.len());
            for id in &ids {
                replies.push(rpc.receive(id).await?);
            }
            Ok::<_, HwError>(replies)
        };
        let result = op.run(batch).await;
        if let Err(e) = &result {
            self.settle(e).await;
        }
        result
    }

    /// Query `get_version_info` and publish id and lock state on the key
    async fn refresh_version_info(&mut self, op: &mut OperationGuard) -> HwResult<JadeState> {
        let reply = self.call::<()>(op, "get_version_info", None).await?;
        let info: VersionInfo = reply
            .deserialized()
            .map_err(|e| HwError::Protocol(format!("invalid version info: {}", e)))?;
        info!("✅ Jade {} on {}, state {}", info.version, self.port.port, info.state);

        let id = if info.efusemac.is_empty() { self.port.port.clone() } else { info.efusemac.clone() };
        let state = info.state();
        let locked = state == JadeState::Locked;
        self.session.update_key(|key| {
            key.id = id;
            key.label = JADE_LABEL.to_string();
            key.vendor = JADE_VENDOR.to_string();
            key.status = (if locked { status::LOCKED } else { status::NOT_INITED }).to_string();
        });
        self.info = Some(info);
        Ok(state)
    }

    /// Require an unlocked wallet, `auth_user` only confirms it
    async fn ensure_ready(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        if self.authenticated {
            return Ok(());
        }
        let mut state = self
            .info
            .as_ref()
            .map(VersionInfo::state)
            .ok_or_else(|| HwError::Internal("Jade used before init".into()))?;
        if !state.has_wallet() {
            // the user may have unlocked it since the scan
            state = self.refresh_version_info(op).await?;
        }
        match state {
            JadeState::Locked => {
                op.set_status(status::LOCKED);
                return Err(HwError::DeviceLocked("unlock Jade with its PIN first".into()));
            }
            JadeState::Uninit | JadeState::Unsaved => {
                return Err(HwError::DeviceLocked("Jade has no wallet set up".into()));
            }
            _ => {}
        }

        let params = AuthUserParams { network: self.network(), epoch: unix_epoch() };
        match self.call(op, "auth_user", Some(&params)).await? {
            Value::Bool(true) => {
                self.authenticated = true;
                Ok(())
            }
            other => {
                debug!(reply = ?other, "auth_user asked for a PIN handshake");
                op.set_status(status::LOCKED);
                Err(HwError::DeviceLocked("Jade requires PIN entry".into()))
            }
        }
    }

    async fn xpub(&mut self, op: &mut OperationGuard, path: Bip32Path) -> HwResult<String> {
        debug!(path = %path, "requesting xpub");
        let params = GetXpubParams { network: self.network(), path: path.path };
        let reply = self.call(op, "get_xpub", Some(&params)).await?;
        expect_text(reply, "xpub")
    }

    /// Input pubkeys derived from the account xpubs
    async fn input_pubkeys(&mut self, op: &mut OperationGuard, inputs: &[SigningInput]) -> HwResult<Vec<Vec<u8>>> {
        let secp = Secp256k1::verification_only();
        let mut accounts: HashMap<Purpose, Xpub> = HashMap::new();
        let mut pubkeys = Vec::with_capacity(inputs.len());
        for input in inputs {
            let account_path = Bip32Path::account(input.purpose, self.testnet);
            if !accounts.contains_key(&input.purpose) {
                let xpub = Xpub::from_str(&self.xpub(op, account_path.clone()).await?)?;
                accounts.insert(input.purpose, xpub);
            }
            let account = accounts
                .get(&input.purpose)
                .ok_or_else(|| HwError::Internal("account xpub missing".into()))?;
            let relative: Vec<ChildNumber> = input
                .path
                .path
                .get(account_path.path.len()..)
                .unwrap_or_default()
                .iter()
                .map(|index| ChildNumber::from(*index))
                .collect();
            let child = account.derive_pub(&secp, &relative)?;
            pubkeys.push(child.public_key.serialize().to_vec());
        }
        Ok(pubkeys)
    }

    fn tx_input(&self, req: &TxSignRequest, input: &SigningInput, pubkey: &[u8]) -> HwResult<TxInputParams> {
        if input.purpose.is_segwit() {
            return Ok(TxInputParams {
                is_witness: true,
                path: input.path.path.clone(),
                script: CborBytes(p2pkh_script(pubkey).into_bytes()),
                satoshi: Some(input.utxo.value),
                input_tx: None,
            });
        }
        req.supporting_tx(&input.utxo.txid)?;
        let raw = req
            .supporting_txs
            .get(&input.utxo.txid)
            .ok_or_else(|| HwError::MissingSupportingTx(input.utxo.txid.to_string()))?;
        Ok(TxInputParams {
            is_witness: false,
            path: input.path.path.clone(),
            script: CborBytes(input.utxo.script_pubkey.to_bytes()),
            satoshi: None,
            input_tx: Some(CborBytes(raw.clone())),
        })
    }
}

#[async_trait]
impl DeviceInterface for JadeDevice {
    fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Jade
    }

    #[instrument(skip_all, fields(port = %self.port.port))]
    async fn init(&mut self, op: &mut OperationGuard) -> HwResult<()> {
        if self.info.is_some() {
            return Ok(());
        }
        self.refresh_version_info(op).await.map(|_| ())
    }

    async fn clear_session(&mut self, _op: &mut OperationGuard) -> HwResult<()> {
        debug!(port = %self.port.port, "Jade has no session to clear");
        Ok(())
    }

    #[instrument(skip_all, fields(port = %self.port.port))]
    async fn get_public_keys(&mut self, op: &mut OperationGuard) -> HwResult<HwWalletInfo> {
        self.ensure_ready(op).await?;
        let xpub_root = self.xpub(op, Bip32Path::root()).await?;
        let xpub_legacy = self.xpub(op, Bip32Path::account(Purpose::NonSegWit, self.testnet)).await?;
        let xpub_nested_segwit = self.xpub(op, Bip32Path::account(Purpose::Nested, self.testnet)).await?;
        let xpub_native_segwit = self.xpub(op, Bip32Path::account(Purpose::Native, self.testnet)).await?;
        op.set_status(status::READY);
        info!("public keys exported");

        let key = self.session.key();
        Ok(HwWalletInfo {
            wallet_type: DeviceType::Jade,
            label: key.label,
            vendor: key.vendor,
            device_id: key.id,
            xpub_root,
            xpub_legacy,
            xpub_nested_segwit,
            xpub_native_segwit,
        })
    }

    #[instrument(skip_all, fields(port = %self.port.port, inputs = req.inputs.len()))]
    async fn sign_tx(&mut self, op: &mut OperationGuard, req: &TxSignRequest) -> HwResult<Vec<u8>> {
        self.ensure_ready(op).await?;
        let inputs = req.signing_inputs(self.testnet)?;
        let pubkeys = self.input_pubkeys(op, &inputs).await?;
        let tx_inputs = inputs
            .iter()
            .zip(&pubkeys)
            .map(|(input, pubkey)| self.tx_input(req, input, pubkey))
            .collect::<HwResult<Vec<_>>>()?;

        let params = SignTxParams {
            network: self.network(),
            txn: CborBytes(serialize(&req.unsigned_transaction())),
            num_inputs: inputs.len() as u32,
            use_ae_signatures: false,
            change: change_entries(req, self.testnet)?,
        };
        op.set_status(status::CONFIRM_ON_DEVICE);
        op.set_blocked(true);
        let accepted = self.call(op, "sign_tx", Some(&params)).await;
        op.set_blocked(false);
        match accepted? {
            Value::Bool(true) => {}
            other => return Err(HwError::Protocol(format!("unexpected sign_tx reply: {:?}", other))),
        }

        let replies = self.call_batch(op, "tx_input", &tx_inputs).await?;
        let signatures = replies
            .into_iter()
            .zip(pubkeys)
            .map(|(reply, pubkey)| {
                let signature = normalize_signature(expect_bytes(reply, "signature")?)?;
                Ok(InputSignature { signature, pubkey })
            })
            .collect::<HwResult<Vec<_>>>()?;

        let tx = finalize_transaction(req, &signatures)?;
        verify_signed_transaction(req, &tx)?;
        op.set_status(status::READY);
        info!(txid = %tx.txid(), "✅ transaction signed");
        Ok(serialize(&tx))
    }

    async fn retrieve_xpub_root(&mut self, op: &mut OperationGuard) -> HwResult<String> {
        self.ensure_ready(op).await?;
        let xpub = self.xpub(op, Bip32Path::root()).await?;
        let wallet_id = compute_wallet_id(&xpub)?;
        self.session.update_key(|key| {
            key.wallet_id = wallet_id;
            key.status = status::READY.to_string();
        });
        Ok(xpub)
    }

    async fn release(&mut self) -> HwResult<()> {
        self.close().await;
        self.info = None;
        Ok(())
    }
}
