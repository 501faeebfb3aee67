//! Ledger Bitcoin app commands
//!
//! Public key export and the two signing workflows: segwit inputs are
//! committed by amount (no previous transaction needed), legacy inputs go
//! through trusted inputs built by streaming each previous transaction.

use super::apdu::{ApduCommand, ApduInstruction, MAX_APDU_DATA};
use crate::core::bip32::{Bip32Path, Purpose};
use crate::core::errors::{HwError, HwResult};
use crate::core::signing::{finalize_transaction, verify_signed_transaction, InputSignature};
use crate::core::tx_request::{p2pkh_script, script_for, SigningInput, TxSignRequest, TX_VERSION};
use crate::core::types::status;
use crate::hardware::session::OperationGuard;
use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use tracing::{debug, info, instrument, warn};

const XPUB_VERSION_MAINNET: u32 = 0x0488_B21E;
const XPUB_VERSION_TESTNET: u32 = 0x0435_87CF;

const INPUT_FLAG_TRUSTED: u8 = 0x01;
const INPUT_FLAG_SEGWIT: u8 = 0x02;

/// Sends one APDU and returns its data, non-OK status words become errors
#[async_trait]
pub trait ApduExchange: Send {
    async fn exchange(&mut self, command: ApduCommand) -> HwResult<Vec<u8>>;
}

/// Parsed `GET_WALLET_PUBLIC_KEY` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletPublicKey {
    /// Compressed
    pub pubkey: Vec<u8>,
    pub address: String,
    pub chain_code: [u8; 32],
}

impl WalletPublicKey {
    pub fn parse(data: &[u8]) -> HwResult<Self> {
        let mut reader = Reader::new(data);
        let pk_len = reader.byte()? as usize;
        let raw_pubkey = reader.take(pk_len)?;
        let addr_len = reader.byte()? as usize;
        let address = String::from_utf8_lossy(reader.take(addr_len)?).into_owned();
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(reader.take(32)?);

        let pubkey = PublicKey::from_slice(raw_pubkey)?.serialize().to_vec();
        Ok(Self { pubkey, address, chain_code })
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        let digest = hash160::Hash::hash(&self.pubkey);
        let mut fp = [0u8; 4];
        fp.copy_from_slice(&digest.as_byte_array()[..4]);
        fp
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> HwResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, len: usize) -> HwResult<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(HwError::Protocol(format!(
                "truncated response: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn varint(n: usize) -> Vec<u8> {
    serialize(&VarInt(n as u64))
}

/// First byte forced to 0x30, sighash byte appended when missing
pub fn normalize_signature(mut raw: Vec<u8>) -> HwResult<Vec<u8>> {
    if raw.len() < 8 {
        return Err(HwError::Protocol(format!("signature too short: {} bytes", raw.len())));
    }
    raw[0] = 0x30;
    let der_len = raw[1] as usize + 2;
    if raw.len() == der_len {
        raw.push(0x01);
    } else if raw.len() != der_len + 1 {
        return Err(HwError::Protocol(format!(
            "signature length {} does not match DER header {}",
            raw.len(),
            der_len
        )));
    }
    Ok(raw)
}

pub struct LedgerBitcoinApp<E> {
    channel: E,
    testnet: bool,
}

impl<E: ApduExchange> LedgerBitcoinApp<E> {
    pub fn new(channel: E, testnet: bool) -> Self {
        Self { channel, testnet }
    }

    async fn send(&mut self, ins: ApduInstruction, p1: u8, p2: u8, data: Vec<u8>) -> HwResult<Vec<u8>> {
        self.channel.exchange(ApduCommand::new(ins, p1, p2, data)).await
    }

    /// Continuation data split at the APDU size limit
    async fn send_chunked(&mut self, ins: ApduInstruction, data: &[u8]) -> HwResult<Vec<u8>> {
        let mut last = Vec::new();
        for chunk in data.chunks(MAX_APDU_DATA) {
            last = self.send(ins, 0x80, 0x00, chunk.to_vec()).await?;
        }
        Ok(last)
    }

    pub async fn firmware_version(&mut self) -> HwResult<String> {
        let data = self.send(ApduInstruction::GetFirmwareVersion, 0x00, 0x00, Vec::new()).await?;
        if data.len() < 5 {
            return Err(HwError::Protocol(format!("firmware version response too short: {:02x?}", data)));
        }
        Ok(format!("{}.{}.{}", data[2], data[3], data[4]))
    }

    pub async fn get_wallet_public_key(&mut self, path: &Bip32Path) -> HwResult<WalletPublicKey> {
        let data = self
            .send(ApduInstruction::GetWalletPublicKey, 0x00, 0x00, path.to_bytes())
            .await?;
        WalletPublicKey::parse(&data)
    }

    /// BIP32 serialized xpub for `path`
    #[instrument(skip(self))]
    pub async fn get_xpub(&mut self, path: &Bip32Path) -> HwResult<String> {
        let parent_fingerprint = match path.parent() {
            Some(parent) if !path.path.is_empty() => {
                self.get_wallet_public_key(&parent).await?.fingerprint()
            }
            _ => [0u8; 4],
        };
        let node = self.get_wallet_public_key(path).await?;

        let version = if self.testnet { XPUB_VERSION_TESTNET } else { XPUB_VERSION_MAINNET };
        let mut raw = Vec::with_capacity(78);
        raw.extend_from_slice(&version.to_be_bytes());
        raw.push(path.depth());
        raw.extend_from_slice(&parent_fingerprint);
        raw.extend_from_slice(&path.last().to_be_bytes());
        raw.extend_from_slice(&node.chain_code);
        raw.extend_from_slice(&node.pubkey);

        Ok(Xpub::decode(&raw)?.to_string())
    }

    /// Sign every input and return the verified transaction
    pub async fn sign_transaction(&mut self, op: &OperationGuard, req: &TxSignRequest) -> HwResult<Transaction> {
        let inputs = req.signing_inputs(self.testnet)?;
        let legacy = inputs.iter().filter(|i| i.purpose == Purpose::NonSegWit).count();
        if legacy > 0 && legacy < inputs.len() {
            return Err(HwError::InvalidRequest(
                "Ledger can't sign legacy and segwit inputs in one transaction".into(),
            ));
        }

        let mut pubkeys = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let node = self.get_wallet_public_key(&input.path).await?;
            if script_for(input.purpose, &node.pubkey) != input.utxo.script_pubkey {
                warn!(path = %input.path, "device key does not match the spent output");
                return Err(HwError::PassphraseVerification);
            }
            pubkeys.push(node.pubkey);
        }

        let raw_signatures = if legacy == 0 {
            info!(inputs = inputs.len(), "signing segwit transaction");
            self.sign_segwit(op, req, &inputs, &pubkeys).await?
        } else {
            info!(inputs = inputs.len(), "signing legacy transaction");
            self.sign_legacy(op, req, &inputs).await?
        };

        let signatures: Vec<InputSignature> = raw_signatures
            .into_iter()
            .zip(pubkeys)
            .map(|(signature, pubkey)| InputSignature { signature, pubkey })
            .collect();
        let tx = finalize_transaction(req, &signatures)?;
        verify_signed_transaction(req, &tx)?;
        Ok(tx)
    }

    async fn sign_segwit(
        &mut self,
        op: &OperationGuard,
        req: &TxSignRequest,
        inputs: &[SigningInput],
        pubkeys: &[Vec<u8>],
    ) -> HwResult<Vec<Vec<u8>>> {
        let sequence = req.sequence().0.to_le_bytes();

        let mut header = TX_VERSION.to_le_bytes().to_vec();
        header.extend(varint(inputs.len()));
        self.send(ApduInstruction::HashInputStart, 0x00, 0x02, header).await?;
        for input in inputs {
            let mut payload = segwit_input_prefix(input);
            payload.extend(varint(0));
            payload.extend_from_slice(&sequence);
            self.send(ApduInstruction::HashInputStart, 0x80, 0x00, payload).await?;
        }

        self.finalize_outputs(op, req).await?;

        let mut signatures = Vec::with_capacity(inputs.len());
        for (input, pubkey) in inputs.iter().zip(pubkeys) {
            let mut header = TX_VERSION.to_le_bytes().to_vec();
            header.extend(varint(1));
            self.send(ApduInstruction::HashInputStart, 0x00, 0x80, header).await?;

            let script_code = p2pkh_script(pubkey);
            let mut payload = segwit_input_prefix(input);
            payload.extend(varint(script_code.len()));
            self.send(ApduInstruction::HashInputStart, 0x80, 0x00, payload).await?;

            let mut tail = script_code.to_bytes();
            tail.extend_from_slice(&sequence);
            self.send_chunked(ApduInstruction::HashInputStart, &tail).await?;

            signatures.push(self.hash_sign(op, &input.path).await?);
        }
        Ok(signatures)
    }

    async fn sign_legacy(
        &mut self,
        op: &OperationGuard,
        req: &TxSignRequest,
        inputs: &[SigningInput],
    ) -> HwResult<Vec<Vec<u8>>> {
        let sequence = req.sequence().0.to_le_bytes();

        let mut trusted = Vec::with_capacity(inputs.len());
        for input in inputs {
            trusted.push(self.get_trusted_input(req, input).await?);
        }

        let mut signatures = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let mut header = TX_VERSION.to_le_bytes().to_vec();
            header.extend(varint(inputs.len()));
            let p2 = if i == 0 { 0x00 } else { 0x80 };
            self.send(ApduInstruction::HashInputStart, 0x00, p2, header).await?;

            for (j, token) in trusted.iter().enumerate() {
                let script = if i == j { input.utxo.script_pubkey.to_bytes() } else { Vec::new() };
                let mut payload = vec![INPUT_FLAG_TRUSTED, token.len() as u8];
                payload.extend_from_slice(token);
                payload.extend(varint(script.len()));
                self.send(ApduInstruction::HashInputStart, 0x80, 0x00, payload).await?;

                let mut tail = script;
                tail.extend_from_slice(&sequence);
                self.send_chunked(ApduInstruction::HashInputStart, &tail).await?;
            }

            self.finalize_outputs(op, req).await?;
            signatures.push(self.hash_sign(op, &input.path).await?);
        }
        Ok(signatures)
    }

    /// Stream the previous transaction, the last response is the trusted input
    async fn get_trusted_input(&mut self, req: &TxSignRequest, input: &SigningInput) -> HwResult<Vec<u8>> {
        let prev = req.supporting_tx(&input.utxo.txid)?;
        debug!(txid = %input.utxo.txid, vout = input.utxo.vout, "building trusted input");

        let mut header = input.utxo.vout.to_be_bytes().to_vec();
        header.extend_from_slice(&prev.version.0.to_le_bytes());
        header.extend(varint(prev.input.len()));
        self.send(ApduInstruction::GetTrustedInput, 0x00, 0x00, header).await?;

        for txin in &prev.input {
            let mut payload = serialize(&txin.previous_output);
            payload.extend(varint(txin.script_sig.len()));
            self.send(ApduInstruction::GetTrustedInput, 0x80, 0x00, payload).await?;

            let mut tail = txin.script_sig.to_bytes();
            tail.extend_from_slice(&txin.sequence.0.to_le_bytes());
            self.send_chunked(ApduInstruction::GetTrustedInput, &tail).await?;
        }

        self.send(ApduInstruction::GetTrustedInput, 0x80, 0x00, varint(prev.output.len()))
            .await?;
        for txout in &prev.output {
            let mut payload = txout.value.to_sat().to_le_bytes().to_vec();
            payload.extend(varint(txout.script_pubkey.len()));
            self.send(ApduInstruction::GetTrustedInput, 0x80, 0x00, payload).await?;
            if !txout.script_pubkey.is_empty() {
                self.send_chunked(ApduInstruction::GetTrustedInput, txout.script_pubkey.as_bytes())
                    .await?;
            }
        }

        let token = self
            .send(
                ApduInstruction::GetTrustedInput,
                0x80,
                0x00,
                prev.lock_time.to_consensus_u32().to_le_bytes().to_vec(),
            )
            .await?;
        if token.is_empty() || token.len() > u8::MAX as usize {
            return Err(HwError::Protocol(format!("unexpected trusted input of {} bytes", token.len())));
        }
        Ok(token)
    }

    /// Change path first, then the serialized outputs; the user confirms them
    async fn finalize_outputs(&mut self, op: &OperationGuard, req: &TxSignRequest) -> HwResult<()> {
        if let Some((_, path)) = req.change_path(self.testnet)? {
            self.send(ApduInstruction::HashInputFinalizeFull, 0xFF, 0x00, path.to_bytes())
                .await?;
        }

        let outputs = req.outputs();
        let mut payload = varint(outputs.len());
        for output in &outputs {
            payload.extend(serialize(output));
        }

        op.set_status(status::CONFIRM_ON_DEVICE);
        op.set_blocked(true);
        let chunks: Vec<&[u8]> = payload.chunks(MAX_APDU_DATA).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let p1 = if i == last { 0x80 } else { 0x00 };
            self.send(ApduInstruction::HashInputFinalizeFull, p1, 0x00, chunk.to_vec())
                .await?;
        }
        op.set_blocked(false);
        Ok(())
    }

    async fn hash_sign(&mut self, op: &OperationGuard, path: &Bip32Path) -> HwResult<Vec<u8>> {
        let mut payload = path.to_bytes();
        payload.push(0x00);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.push(0x01);

        op.set_blocked(true);
        let raw = self.send(ApduInstruction::HashSign, 0x00, 0x00, payload).await?;
        op.set_blocked(false);
        normalize_signature(raw)
    }
}

/// 0x02, txid, vout LE, value LE
fn segwit_input_prefix(input: &SigningInput) -> Vec<u8> {
    let mut payload = vec![INPUT_FLAG_SEGWIT];
    payload.extend_from_slice(&input.utxo.txid.to_byte_array());
    payload.extend_from_slice(&input.utxo.vout.to_le_bytes());
    payload.extend_from_slice(&input.utxo.value.to_le_bytes());
    payload
}
