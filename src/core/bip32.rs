//! BIP32 paths used by every device family

use crate::core::errors::{HwError, HwResult};
use bitcoin::ScriptBuf;
use std::fmt;
use std::str::FromStr;

pub const HARDENED: u32 = 0x8000_0000;

/// Account purpose, derived from the script type of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// m/44'
    NonSegWit = 44,
    /// m/49'
    Nested = 49,
    /// m/84'
    Native = 84,
}

impl Purpose {
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Classify a spendable script, `None` for anything not single-sig
    pub fn from_script(script: &ScriptBuf) -> Option<Self> {
        if script.is_p2wpkh() {
            Some(Purpose::Native)
        } else if script.is_p2sh() {
            Some(Purpose::Nested)
        } else if script.is_p2pkh() {
            Some(Purpose::NonSegWit)
        } else {
            None
        }
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, Purpose::NonSegWit)
    }
}

/// 0' on mainnet, 1' on testnet
pub fn coin_type(testnet: bool) -> u32 {
    if testnet {
        1 | HARDENED
    } else {
        HARDENED
    }
}

/// Derivation path as a list of child indexes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bip32Path {
    pub path: Vec<u32>,
}

impl Bip32Path {
    pub fn new(path: Vec<u32>) -> Self {
        Self { path }
    }

    /// m/0', the key a wallet id is computed from
    pub fn root() -> Self {
        Self::new(vec![HARDENED])
    }

    /// m/purpose'/coin'/0'
    pub fn account(purpose: Purpose, testnet: bool) -> Self {
        Self::new(vec![purpose.index() | HARDENED, coin_type(testnet), HARDENED])
    }

    /// Append a relative path such as `0/5`
    pub fn append(&self, relative: &Bip32Path) -> Self {
        let mut path = self.path.clone();
        path.extend_from_slice(&relative.path);
        Self { path }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path.is_empty() {
            return None;
        }
        Some(Self::new(self.path[..self.path.len() - 1].to_vec()))
    }

    pub fn depth(&self) -> u8 {
        self.path.len() as u8
    }

    pub fn last(&self) -> u32 {
        self.path.last().copied().unwrap_or(0)
    }

    /// Length prefix followed by big-endian indexes (Ledger wire form)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.path.len() * 4);
        bytes.push(self.path.len() as u8);
        for index in &self.path {
            bytes.extend_from_slice(&index.to_be_bytes());
        }
        bytes
    }
}

impl FromStr for Bip32Path {
    type Err = HwError;

    /// Accepts `m/84'/0'/0'`, `84h/0h/0h` and relative `0/5`
    fn from_str(raw: &str) -> HwResult<Self> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("m/")
            .or_else(|| if trimmed == "m" { Some("") } else { None })
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Ok(Self::default());
        }

        let mut path = Vec::new();
        for part in body.split('/') {
            let hardened = part.ends_with('\'') || part.ends_with('h') || part.ends_with('H');
            let digits = part.trim_end_matches(['\'', 'h', 'H']);
            let index: u32 = digits
                .parse()
                .map_err(|_| HwError::InvalidRequest(format!("invalid path element '{}' in {}", part, raw)))?;
            if index >= HARDENED {
                return Err(HwError::InvalidRequest(format!("path index out of range: {}", part)));
            }
            path.push(if hardened { index | HARDENED } else { index });
        }
        Ok(Self { path })
    }
}

impl fmt::Display for Bip32Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for index in &self.path {
            if index & HARDENED != 0 {
                write!(f, "/{}'", index & !HARDENED)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}
