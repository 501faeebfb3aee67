//! Unsigned transaction model handed to a device for signing

use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::wallet::WalletsProvider;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    WPubkeyHash, Witness,
};
use std::collections::HashMap;
use std::str::FromStr;

/// Sequence number signalling replace-by-fee
pub const RBF_SEQUENCE: u32 = u32::MAX - 2;
pub const TX_VERSION: i32 = 1;

/// Output being spent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Satoshis
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn purpose(&self) -> Option<Purpose> {
        Purpose::from_script(&self.script_pubkey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub value: u64,
}

/// Change back to the signing wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub value: u64,
    /// Relative address index, e.g. `1/4`
    pub index: String,
}

/// Input with its full derivation path
#[derive(Debug, Clone)]
pub struct SigningInput {
    pub utxo: Utxo,
    pub purpose: Purpose,
    pub path: Bip32Path,
}

/// Everything a device needs to sign one transaction
#[derive(Debug, Clone, Default)]
pub struct TxSignRequest {
    pub inputs: Vec<Utxo>,
    pub recipients: Vec<Recipient>,
    pub change: Option<ChangeOutput>,
    pub rbf: bool,
    pub wallet_ids: Vec<String>,
    /// Raw transactions spent by legacy inputs
    pub supporting_txs: HashMap<Txid, Vec<u8>>,
    /// Relative address index per input, filled by `resolve_input_indices`
    pub input_indices: Vec<String>,
}

impl TxSignRequest {
    pub fn sequence(&self) -> Sequence {
        if self.rbf {
            Sequence(RBF_SEQUENCE)
        } else {
            Sequence::MAX
        }
    }

    pub fn has_legacy_input(&self) -> bool {
        self.inputs
            .iter()
            .any(|utxo| utxo.purpose() == Some(Purpose::NonSegWit))
    }

    /// Change is only emitted when it carries value
    pub fn change_output(&self) -> Option<&ChangeOutput> {
        self.change.as_ref().filter(|change| change.value > 0)
    }

    /// Recipients followed by change, in signing order
    pub fn outputs(&self) -> Vec<TxOut> {
        let mut outputs: Vec<TxOut> = self
            .recipients
            .iter()
            .map(|r| TxOut { value: Amount::from_sat(r.value), script_pubkey: r.script_pubkey.clone() })
            .collect();
        if let Some(change) = self.change_output() {
            outputs.push(TxOut {
                value: Amount::from_sat(change.value),
                script_pubkey: change.script_pubkey.clone(),
            });
        }
        outputs
    }

    /// Transaction with empty script-sigs and witnesses
    pub fn unsigned_transaction(&self) -> Transaction {
        let sequence = self.sequence();
        Transaction {
            version: Version(TX_VERSION),
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs(),
        }
    }

    /// Parsed supporting transaction for a legacy input
    pub fn supporting_tx(&self, txid: &Txid) -> HwResult<Transaction> {
        let raw = self
            .supporting_txs
            .get(txid)
            .ok_or_else(|| HwError::MissingSupportingTx(txid.to_string()))?;
        let tx: Transaction = deserialize(raw)?;
        if tx.txid() != *txid {
            return Err(HwError::InvalidRequest(format!(
                "supporting transaction hashes to {}, expected {}",
                tx.txid(),
                txid
            )));
        }
        Ok(tx)
    }

    /// Look up the address index of every input in the request's wallets
    pub fn resolve_input_indices(&mut self, wallets: &dyn WalletsProvider) -> HwResult<()> {
        if self.input_indices.len() == self.inputs.len() {
            return Ok(());
        }
        let candidates: Vec<_> = self
            .wallet_ids
            .iter()
            .filter_map(|id| wallets.wallet_by_id(id))
            .collect();

        let mut indices = Vec::with_capacity(self.inputs.len());
        for utxo in &self.inputs {
            let index = candidates
                .iter()
                .find_map(|wallet| wallet.address_index(&utxo.script_pubkey))
                .ok_or_else(|| HwError::MissingAddressIndex(utxo.outpoint().to_string()))?;
            indices.push(index);
        }
        self.input_indices = indices;
        Ok(())
    }

    /// Inputs with purpose and full path, requires resolved indices
    pub fn signing_inputs(&self, testnet: bool) -> HwResult<Vec<SigningInput>> {
        if self.inputs.is_empty() {
            return Err(HwError::InvalidRequest("transaction has no inputs".into()));
        }
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, utxo)| {
                let index = self
                    .input_indices
                    .get(i)
                    .ok_or_else(|| HwError::MissingAddressIndex(utxo.outpoint().to_string()))?;
                let purpose = utxo.purpose().ok_or_else(|| {
                    HwError::InvalidRequest(format!("unsupported input script at {}", utxo.outpoint()))
                })?;
                let path = Bip32Path::account(purpose, testnet).append(&Bip32Path::from_str(index)?);
                Ok(SigningInput { utxo: utxo.clone(), purpose, path })
            })
            .collect()
    }

    /// Full path and purpose of the change output
    pub fn change_path(&self, testnet: bool) -> HwResult<Option<(Purpose, Bip32Path)>> {
        let Some(change) = self.change_output() else {
            return Ok(None);
        };
        let purpose = Purpose::from_script(&change.script_pubkey).ok_or_else(|| {
            HwError::InvalidRequest(format!("unsupported change script for {}", change.address))
        })?;
        let path = Bip32Path::account(purpose, testnet).append(&Bip32Path::from_str(&change.index)?);
        Ok(Some((purpose, path)))
    }
}

pub fn pubkey_hash(pubkey: &[u8]) -> hash160::Hash {
    hash160::Hash::hash(pubkey)
}

/// 76a914{20}88ac, also the BIP143 script code of a p2wpkh spend
pub fn p2pkh_script(pubkey: &[u8]) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(pubkey_hash(pubkey)))
}

/// 0014{20}
pub fn p2wpkh_script(pubkey: &[u8]) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_raw_hash(pubkey_hash(pubkey)))
}

/// Redeem script of a nested segwit output
pub fn nested_redeem_script(pubkey: &[u8]) -> ScriptBuf {
    p2wpkh_script(pubkey)
}

/// a914{20}87 wrapping the p2wpkh redeem script
pub fn p2sh_p2wpkh_script(pubkey: &[u8]) -> ScriptBuf {
    ScriptBuf::new_p2sh(&nested_redeem_script(pubkey).script_hash())
}

/// Output script a key controls under the given purpose
pub fn script_for(purpose: Purpose, pubkey: &[u8]) -> ScriptBuf {
    match purpose {
        Purpose::NonSegWit => p2pkh_script(pubkey),
        Purpose::Nested => p2sh_p2wpkh_script(pubkey),
        Purpose::Native => p2wpkh_script(pubkey),
    }
}
