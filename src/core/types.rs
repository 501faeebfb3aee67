//! Shared device identity and wallet info types

use crate::core::errors::HwError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device status strings shown next to a key
pub mod status {
    pub const READY: &str = "ready";
    /// Root xpub has not been read from the device yet
    pub const NOT_INITED: &str = "not inited";
    pub const CONFIRM_ON_DEVICE: &str = "confirm on device";
    pub const PRESS_BUTTON: &str = "press the button on device";
    pub const ENTER_PIN: &str = "enter pin";
    pub const ENTER_PASSPHRASE: &str = "enter passphrase";
    pub const LOCKED: &str = "locked";
}

/// Device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Unset key, rejected by routing
    #[default]
    None,
    Ledger,
    Trezor,
    Jade,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::None => "none",
            DeviceType::Ledger => "ledger",
            DeviceType::Trezor => "trezor",
            DeviceType::Jade => "jade",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = HwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ledger" => Ok(DeviceType::Ledger),
            "trezor" => Ok(DeviceType::Trezor),
            "jade" => Ok(DeviceType::Jade),
            other => Err(HwError::UnsupportedDeviceType(other.to_string())),
        }
    }
}

/// Identity of one attached device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    pub label: String,
    /// Unique within its family for one scan
    pub id: String,
    pub vendor: String,
    /// Empty until bound to a known wallet
    pub wallet_id: String,
    pub status: String,
    pub device_type: DeviceType,
}

impl DeviceKey {
    pub fn new(
        device_type: DeviceType,
        id: impl Into<String>,
        label: impl Into<String>,
        vendor: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            id: id.into(),
            vendor: vendor.into(),
            wallet_id: String::new(),
            status: String::new(),
            device_type,
        }
    }

    /// Routing equality, ignores label, status and binding
    pub fn same_device(&self, other: &DeviceKey) -> bool {
        self.device_type == other.device_type && self.id == other.id
    }

    /// Parse the CLI form `<type>:<id>`
    pub fn parse_selector(selector: &str) -> Result<(DeviceType, String), HwError> {
        let (kind, id) = selector.split_once(':').ok_or_else(|| {
            HwError::InvalidRequest(format!("expected <type>:<id>, got {}", selector))
        })?;
        if id.is_empty() {
            return Err(HwError::InvalidRequest("device id is empty".into()));
        }
        Ok((kind.parse()?, id.to_string()))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} {})", self.device_type, self.id, self.vendor, self.label)
    }
}

/// Public key bundle read from one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwWalletInfo {
    pub wallet_type: DeviceType,
    pub label: String,
    pub vendor: String,
    pub device_id: String,
    /// m/0'
    pub xpub_root: String,
    /// m/44'/c'/0'
    pub xpub_legacy: String,
    /// m/49'/c'/0'
    pub xpub_nested_segwit: String,
    /// m/84'/c'/0'
    pub xpub_native_segwit: String,
}

impl HwWalletInfo {
    pub fn is_complete(&self) -> bool {
        !self.xpub_root.is_empty()
            && !self.xpub_legacy.is_empty()
            && !self.xpub_nested_segwit.is_empty()
            && !self.xpub_native_segwit.is_empty()
    }
}
