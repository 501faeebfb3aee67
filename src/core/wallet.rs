//! Wallet lookups the device layer depends on

use crate::core::bip32::HARDENED;
use crate::core::errors::{HwError, HwResult};
use crate::core::types::DeviceType;
use bitcoin::bip32::Xpub;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::{Script, ScriptBuf};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Hardware metadata stored with a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwWalletBinding {
    pub device_type: DeviceType,
    pub vendor: String,
    /// Device id for Trezor and Jade; Ledger rebinds through the root xpub
    pub device_id: String,
}

pub trait HwWallet: Send + Sync {
    fn wallet_id(&self) -> String;

    /// Relative index (`0/5`) of an address this wallet owns
    fn address_index(&self, script: &Script) -> Option<String>;

    fn hw_encryption(&self) -> Option<HwWalletBinding>;
}

pub trait WalletsProvider: Send + Sync {
    fn wallet_by_id(&self, id: &str) -> Option<Arc<dyn HwWallet>>;

    fn wallets(&self) -> Vec<Arc<dyn HwWallet>>;
}

/// Wallet id derived from the `m/0'` xpub
pub fn compute_wallet_id(xpub_root: &str) -> HwResult<String> {
    let xpub = Xpub::from_str(xpub_root)?;
    if xpub.depth != 1 || u32::from(xpub.child_number) != HARDENED {
        return Err(HwError::InvalidRequest(format!(
            "expected an m/0' key, got depth {} child {}",
            xpub.depth, xpub.child_number
        )));
    }
    let digest = hash160::Hash::hash(&xpub.public_key.serialize());
    Ok(bs58::encode(&digest.as_byte_array()[..6]).into_string())
}

/// Wallet backed by an address → index map
#[derive(Debug, Clone, Default)]
pub struct InMemoryWallet {
    id: String,
    addresses: HashMap<ScriptBuf, String>,
    binding: Option<HwWalletBinding>,
}

impl InMemoryWallet {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_binding(mut self, binding: HwWalletBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn add_address(&mut self, script: ScriptBuf, index: impl Into<String>) {
        self.addresses.insert(script, index.into());
    }
}

impl HwWallet for InMemoryWallet {
    fn wallet_id(&self) -> String {
        self.id.clone()
    }

    fn address_index(&self, script: &Script) -> Option<String> {
        self.addresses.get(script).cloned()
    }

    fn hw_encryption(&self) -> Option<HwWalletBinding> {
        self.binding.clone()
    }
}

#[derive(Default)]
pub struct InMemoryWallets {
    wallets: RwLock<HashMap<String, Arc<dyn HwWallet>>>,
}

impl InMemoryWallets {
    pub fn insert(&self, wallet: Arc<dyn HwWallet>) {
        self.wallets.write().insert(wallet.wallet_id(), wallet);
    }
}

impl WalletsProvider for InMemoryWallets {
    fn wallet_by_id(&self, id: &str) -> Option<Arc<dyn HwWallet>> {
        self.wallets.read().get(id).cloned()
    }

    fn wallets(&self) -> Vec<Arc<dyn HwWallet>> {
        self.wallets.read().values().cloned().collect()
    }
}
