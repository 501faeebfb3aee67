//! Signed transaction assembly and verification
//!
//! Every driver funnels its result through `verify_signed_transaction` before
//! the bytes leave the device layer. A mismatch almost always means the
//! device derived keys under a different passphrase.

use crate::core::bip32::Purpose;
use crate::core::errors::{HwError, HwResult};
use crate::core::tx_request::{nested_redeem_script, p2pkh_script, script_for, TxSignRequest};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, ScriptBuf, Transaction, Witness};
use tracing::{debug, warn};

/// DER signature with the sighash byte appended, plus the signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
}

fn push_bytes(data: &[u8]) -> HwResult<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| HwError::Protocol(format!("push of {} bytes exceeds script limits", data.len())))
}

/// Fill script-sigs and witnesses of the unsigned transaction
pub fn finalize_transaction(req: &TxSignRequest, signatures: &[InputSignature]) -> HwResult<Transaction> {
    if signatures.len() != req.inputs.len() {
        return Err(HwError::Protocol(format!(
            "got {} signatures for {} inputs",
            signatures.len(),
            req.inputs.len()
        )));
    }

    let mut tx = req.unsigned_transaction();
    for (i, (utxo, sig)) in req.inputs.iter().zip(signatures).enumerate() {
        let purpose = utxo.purpose().ok_or_else(|| {
            HwError::InvalidRequest(format!("unsupported script for input {}", i))
        })?;
        let input = &mut tx.input[i];
        match purpose {
            Purpose::Native => {
                input.witness = Witness::from_slice(&[sig.signature.as_slice(), sig.pubkey.as_slice()]);
            }
            Purpose::Nested => {
                let redeem = nested_redeem_script(&sig.pubkey);
                input.script_sig = Builder::new()
                    .push_slice(push_bytes(redeem.as_bytes())?)
                    .into_script();
                input.witness = Witness::from_slice(&[sig.signature.as_slice(), sig.pubkey.as_slice()]);
            }
            Purpose::NonSegWit => {
                input.script_sig = Builder::new()
                    .push_slice(push_bytes(&sig.signature)?)
                    .push_slice(push_bytes(&sig.pubkey)?)
                    .into_script();
            }
        }
    }
    Ok(tx)
}

/// Extract (signature, pubkey) from a finalized input
fn input_signature(tx: &Transaction, index: usize, purpose: Purpose) -> HwResult<(Vec<u8>, Vec<u8>)> {
    let input = &tx.input[index];
    match purpose {
        Purpose::Native | Purpose::Nested => {
            if input.witness.len() != 2 {
                return Err(HwError::PassphraseVerification);
            }
            let sig = input.witness.nth(0).unwrap_or_default().to_vec();
            let pubkey = input.witness.nth(1).unwrap_or_default().to_vec();
            Ok((sig, pubkey))
        }
        Purpose::NonSegWit => {
            let mut pushes = Vec::with_capacity(2);
            for instruction in input.script_sig.instructions() {
                match instruction {
                    Ok(Instruction::PushBytes(bytes)) => pushes.push(bytes.as_bytes().to_vec()),
                    _ => return Err(HwError::PassphraseVerification),
                }
            }
            if pushes.len() != 2 {
                return Err(HwError::PassphraseVerification);
            }
            let pubkey = pushes.pop().unwrap_or_default();
            let sig = pushes.pop().unwrap_or_default();
            Ok((sig, pubkey))
        }
    }
}

/// Check every input signature against the spent outputs
pub fn verify_signed_transaction(req: &TxSignRequest, tx: &Transaction) -> HwResult<()> {
    if tx.input.len() != req.inputs.len() {
        warn!("signed transaction has {} inputs, expected {}", tx.input.len(), req.inputs.len());
        return Err(HwError::PassphraseVerification);
    }

    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);

    for (i, utxo) in req.inputs.iter().enumerate() {
        if tx.input[i].previous_output != utxo.outpoint() {
            warn!(input = i, "signed transaction spends a different outpoint");
            return Err(HwError::PassphraseVerification);
        }
        let purpose = utxo.purpose().ok_or_else(|| {
            HwError::InvalidRequest(format!("unsupported script for input {}", i))
        })?;
        let (sig_bytes, pubkey_bytes) = input_signature(tx, i, purpose)?;

        if script_for(purpose, &pubkey_bytes) != utxo.script_pubkey {
            warn!(input = i, "signing key does not match the spent output");
            return Err(HwError::PassphraseVerification);
        }

        let Some((&sighash_byte, der)) = sig_bytes.split_last() else {
            return Err(HwError::PassphraseVerification);
        };
        if sighash_byte != EcdsaSighashType::All as u8 {
            warn!(input = i, sighash_byte, "unexpected sighash type");
            return Err(HwError::PassphraseVerification);
        }

        let digest: [u8; 32] = if purpose.is_segwit() {
            let script_code: ScriptBuf = p2pkh_script(&pubkey_bytes);
            #[allow(deprecated)]
            let hash = cache
                .segwit_signature_hash(i, &script_code, Amount::from_sat(utxo.value), EcdsaSighashType::All)
                .map_err(|e| HwError::Internal(format!("sighash: {}", e)))?;
            hash.to_byte_array()
        } else {
            let hash = cache
                .legacy_signature_hash(i, &utxo.script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| HwError::Internal(format!("sighash: {}", e)))?;
            hash.to_byte_array()
        };

        if let Err(e) = verify_ecdsa(&secp, digest, der, &pubkey_bytes) {
            warn!(input = i, "signature does not verify: {}", e);
            return Err(HwError::PassphraseVerification);
        }
        debug!(input = i, "signature verified");
    }
    Ok(())
}

fn verify_ecdsa(
    secp: &Secp256k1<bitcoin::secp256k1::VerifyOnly>,
    digest: [u8; 32],
    der: &[u8],
    pubkey: &[u8],
) -> Result<(), bitcoin::secp256k1::Error> {
    let pubkey = PublicKey::from_slice(pubkey)?;
    let mut signature = ecdsa::Signature::from_der(der)?;
    signature.normalize_s();
    secp.verify_ecdsa(&Message::from_digest(digest), &signature, &pubkey)
}
