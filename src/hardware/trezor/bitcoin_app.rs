//! Trezor transaction signing session
//!
//! The device drives signing with `TxRequest`s; each is answered from the
//! request being signed or, for legacy inputs, from the supporting
//! transaction it names. Hashes travel in display byte order.

use super::messages::{
    InputScriptType, OutputScriptType, RequestType, SignTx, TransactionType, TxAck,
    TxInputType, TxOutputBinType, TxOutputType, TxRequest,
};
use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::signing::verify_signed_transaction;
use crate::core::tx_request::{SigningInput, TxSignRequest, TX_VERSION};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, Txid};
use std::collections::HashMap;
use tracing::{debug, info};

pub const TESTNET_COIN: &str = "Testnet";
pub const MAINNET_COIN: &str = "Bitcoin";

pub fn coin_name(testnet: bool) -> String {
    if testnet { TESTNET_COIN } else { MAINNET_COIN }.to_string()
}

/// Txid as the device expects it
pub fn display_hash(txid: &Txid) -> Vec<u8> {
    let mut bytes = txid.to_byte_array().to_vec();
    bytes.reverse();
    bytes
}

fn txid_from_display(hash: &[u8]) -> HwResult<Txid> {
    let mut bytes: [u8; 32] = hash
        .try_into()
        .map_err(|_| HwError::Protocol(format!("device asked for a {}-byte tx hash", hash.len())))?;
    bytes.reverse();
    Ok(Txid::from_byte_array(bytes))
}

fn input_script_type(purpose: Purpose) -> InputScriptType {
    match purpose {
        Purpose::Native => InputScriptType::SpendWitness,
        Purpose::Nested => InputScriptType::SpendP2shWitness,
        Purpose::NonSegWit => InputScriptType::SpendAddress,
    }
}

fn change_script_type(purpose: Purpose) -> OutputScriptType {
    match purpose {
        Purpose::Native => OutputScriptType::PayToWitness,
        Purpose::Nested => OutputScriptType::PayToP2shWitness,
        Purpose::NonSegWit => OutputScriptType::PayToAddress,
    }
}

fn ack(tx: TransactionType) -> TxAck {
    TxAck { tx: Some(tx) }
}

/// State of one `sign_tx` call, dropped when it ends
pub struct TrezorSignSession<'a> {
    req: &'a TxSignRequest,
    testnet: bool,
    inputs: Vec<SigningInput>,
    change: Option<(Purpose, Bip32Path)>,
    prev_txs: HashMap<Txid, Transaction>,
    signed: Vec<u8>,
    meta_requests: usize,
}

impl<'a> TrezorSignSession<'a> {
    pub fn new(req: &'a TxSignRequest, testnet: bool) -> HwResult<Self> {
        Ok(Self {
            req,
            testnet,
            inputs: req.signing_inputs(testnet)?,
            change: req.change_path(testnet)?,
            prev_txs: HashMap::new(),
            signed: Vec::new(),
            meta_requests: 0,
        })
    }

    pub fn sign_tx(&self) -> SignTx {
        SignTx {
            outputs_count: self.req.outputs().len() as u32,
            inputs_count: self.req.inputs.len() as u32,
            coin_name: Some(coin_name(self.testnet)),
            version: Some(TX_VERSION as u32),
            lock_time: Some(0),
        }
    }

    /// Number of `TXMETA` requests answered so far
    pub fn meta_requests(&self) -> usize {
        self.meta_requests
    }

    /// Acknowledgement for `request`, `None` once the device is finished
    pub fn answer(&mut self, request: &TxRequest) -> HwResult<Option<TxAck>> {
        if let Some(chunk) = request.serialized.as_ref().and_then(|s| s.serialized_tx.as_ref()) {
            self.signed.extend_from_slice(chunk);
        }

        let details = request.details.clone().unwrap_or_default();
        let index = details.request_index.unwrap_or_default() as usize;
        let prev_hash = details.tx_hash.filter(|h| !h.is_empty());
        let request_type = match request.request_type {
            Some(raw) => RequestType::from_i32(raw)
                .ok_or_else(|| HwError::Protocol(format!("unknown signing request type {}", raw)))?,
            None => return Err(HwError::Protocol("signing request without a request type".into())),
        };

        let reply = match (request_type, prev_hash) {
            (RequestType::TxInput, Some(hash)) => self.prev_input(&hash, index)?,
            (RequestType::TxInput, None) => self.current_input(index)?,
            (RequestType::TxOutput, Some(hash)) => self.prev_output(&hash, index)?,
            (RequestType::TxOutput, None) => self.current_output(index)?,
            (RequestType::TxMeta, Some(hash)) => self.prev_meta(&hash)?,
            (RequestType::TxMeta, None) => {
                return Err(HwError::Protocol("TXMETA without a transaction hash".into()))
            }
            (RequestType::TxFinished, _) => {
                info!(len = self.signed.len(), "device finished signing");
                return Ok(None);
            }
            (other, _) => {
                return Err(HwError::Protocol(format!("unsupported signing request {:?}", other)))
            }
        };
        Ok(Some(reply))
    }

    fn prev_tx(&mut self, hash: &[u8]) -> HwResult<Transaction> {
        let txid = txid_from_display(hash)?;
        if let Some(tx) = self.prev_txs.get(&txid) {
            return Ok(tx.clone());
        }
        let tx = self.req.supporting_tx(&txid)?;
        self.prev_txs.insert(txid, tx.clone());
        Ok(tx)
    }

    fn current_input(&self, index: usize) -> HwResult<TxAck> {
        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| HwError::Protocol(format!("device asked for input {}", index)))?;
        let mut tx_input = TxInputType {
            address_n: input.path.path.clone(),
            prev_hash: display_hash(&input.utxo.txid),
            prev_index: input.utxo.vout,
            script_type: Some(input_script_type(input.purpose) as i32),
            ..Default::default()
        };
        if input.purpose.is_segwit() {
            tx_input.amount = Some(input.utxo.value);
        }
        if self.req.rbf {
            tx_input.sequence = Some(self.req.sequence().0);
        }
        debug!(index, path = %input.path, "TXINPUT");
        Ok(ack(TransactionType { inputs: vec![tx_input], ..Default::default() }))
    }

    fn current_output(&self, index: usize) -> HwResult<TxAck> {
        let output = if let Some(recipient) = self.req.recipients.get(index) {
            TxOutputType {
                address: Some(recipient.address.clone()),
                amount: recipient.value,
                script_type: Some(OutputScriptType::PayToAddress as i32),
                ..Default::default()
            }
        } else if index == self.req.recipients.len() {
            let (change, (purpose, path)) = self
                .req
                .change_output()
                .zip(self.change.clone())
                .ok_or_else(|| HwError::Protocol(format!("device asked for output {}", index)))?;
            TxOutputType {
                address_n: path.path,
                amount: change.value,
                script_type: Some(change_script_type(purpose) as i32),
                ..Default::default()
            }
        } else {
            return Err(HwError::Protocol(format!("device asked for output {}", index)));
        };
        debug!(index, "TXOUTPUT");
        Ok(ack(TransactionType { outputs: vec![output], ..Default::default() }))
    }

    fn prev_input(&mut self, hash: &[u8], index: usize) -> HwResult<TxAck> {
        let tx = self.prev_tx(hash)?;
        let txin = tx
            .input
            .get(index)
            .ok_or_else(|| HwError::Protocol(format!("supporting tx has no input {}", index)))?;
        let input = TxInputType {
            prev_hash: display_hash(&txin.previous_output.txid),
            prev_index: txin.previous_output.vout,
            script_sig: Some(txin.script_sig.as_bytes().to_vec()),
            sequence: Some(txin.sequence.0),
            ..Default::default()
        };
        Ok(ack(TransactionType { inputs: vec![input], ..Default::default() }))
    }

    fn prev_output(&mut self, hash: &[u8], index: usize) -> HwResult<TxAck> {
        let tx = self.prev_tx(hash)?;
        let txout = tx
            .output
            .get(index)
            .ok_or_else(|| HwError::Protocol(format!("supporting tx has no output {}", index)))?;
        let output = TxOutputBinType {
            amount: txout.value.to_sat(),
            script_pubkey: txout.script_pubkey.as_bytes().to_vec(),
        };
        Ok(ack(TransactionType { bin_outputs: vec![output], ..Default::default() }))
    }

    fn prev_meta(&mut self, hash: &[u8]) -> HwResult<TxAck> {
        let tx = self.prev_tx(hash)?;
        self.meta_requests += 1;
        debug!(txid = %tx.txid(), "TXMETA");
        Ok(ack(TransactionType {
            version: Some(tx.version.0 as u32),
            lock_time: Some(tx.lock_time.to_consensus_u32()),
            inputs_cnt: Some(tx.input.len() as u32),
            outputs_cnt: Some(tx.output.len() as u32),
            ..Default::default()
        }))
    }

    /// Parse and verify what the device returned
    pub fn finish(self) -> HwResult<Transaction> {
        if self.signed.is_empty() {
            return Err(HwError::Protocol("device returned no signed transaction".into()));
        }
        let tx: Transaction = deserialize(&self.signed)?;
        verify_signed_transaction(self.req, &tx)?;
        Ok(tx)
    }
}
