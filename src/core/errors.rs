//! Error taxonomy for the device layer
//!
//! Drivers classify failures at the lowest layer that has protocol context.
//! The manager never reinterprets an `HwError`, it only routes it.

use thiserror::Error;

/// Result alias used across the crate
pub type HwResult<T> = Result<T, HwError>;

/// Device layer error
#[derive(Debug, Error)]
pub enum HwError {
    /// Device unplugged, HID open failure, serial I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bridge unreachable or HTTP failure
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed or unexpected wire message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Non-OK APDU status word
    #[error("Device returned status {sw:#06x}: {reason}")]
    Apdu { sw: u16, reason: String },

    /// Device rejected the PIN
    #[error("Invalid PIN")]
    InvalidPin,

    /// User declined the operation on the device
    #[error("Operation cancelled on device")]
    CancelledOnDevice,

    /// Operation cancelled locally through `cancel()`
    #[error("Operation cancelled")]
    Cancelled,

    /// Another operation is already in flight on this device
    #[error("Device is busy with another operation")]
    DeviceBusy,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    #[error("Unsupported firmware {version}, minimum supported is {minimum}")]
    UnsupportedFirmware { version: String, minimum: String },

    /// Spent output has no known BIP32 address index
    #[error("Can't find address index for {0}")]
    MissingAddressIndex(String),

    /// Legacy input spends a transaction that was never attached to the request
    #[error("Previous transaction {0} is not attached to the sign request")]
    MissingSupportingTx(String),

    /// Signed transaction does not verify against the spent outputs
    #[error("signing failed, check your passphrase")]
    PassphraseVerification,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Device scan already in progress")]
    ScanInProgress,

    /// Device needs to be unlocked before use
    #[error("Device is locked: {0}")]
    DeviceLocked(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HwError {
    /// Prompts and cancellations are part of the interactive flow
    pub fn is_user_action(&self) -> bool {
        matches!(
            self,
            HwError::InvalidPin | HwError::CancelledOnDevice | HwError::Cancelled
        )
    }

    /// Device or bridge unreachable
    pub fn is_transport(&self) -> bool {
        matches!(self, HwError::Transport(_) | HwError::Network(_))
    }

    /// Transport-level failures require a re-scan from the caller
    pub fn requires_rescan(&self) -> bool {
        matches!(
            self,
            HwError::Transport(_) | HwError::Network(_) | HwError::Timeout(_)
        ) || matches!(self, HwError::Apdu { sw, .. } if *sw == 0x6FAA)
    }

    /// Reason string reported through `OperationFailed`
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for HwError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => HwError::Timeout(err.to_string()),
            _ => HwError::Transport(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for HwError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HwError::Timeout(format!("bridge request timed out: {}", err))
        } else {
            HwError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HwError {
    fn from(err: serde_json::Error) -> Self {
        HwError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HwError {
    fn from(err: toml::de::Error) -> Self {
        HwError::Config(err.to_string())
    }
}

impl From<prost::DecodeError> for HwError {
    fn from(err: prost::DecodeError) -> Self {
        HwError::Protocol(format!("failed to parse response: {}", err))
    }
}

impl From<hex::FromHexError> for HwError {
    fn from(err: hex::FromHexError) -> Self {
        HwError::Protocol(format!("invalid hex payload: {}", err))
    }
}

impl From<bitcoin::consensus::encode::Error> for HwError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        HwError::Serialization(err.to_string())
    }
}

impl From<bitcoin::bip32::Error> for HwError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        HwError::Protocol(format!("invalid extended key: {}", err))
    }
}

impl From<bitcoin::secp256k1::Error> for HwError {
    fn from(err: bitcoin::secp256k1::Error) -> Self {
        HwError::Protocol(format!("invalid key material: {}", err))
    }
}

#[cfg(feature = "ledger")]
impl From<hidapi::HidError> for HwError {
    fn from(err: hidapi::HidError) -> Self {
        HwError::Transport(err.to_string())
    }
}

#[cfg(feature = "jade")]
impl From<tokio_serial::Error> for HwError {
    fn from(err: tokio_serial::Error) -> Self {
        HwError::Transport(err.to_string())
    }
}
