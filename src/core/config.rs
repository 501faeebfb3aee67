//! Device layer configuration
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use crate::core::errors::{HwError, HwResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Trezor bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrezorConfig {
    /// Local bridge endpoint
    #[serde(default = "TrezorConfig::default_bridge_url")]
    pub bridge_url: String,

    /// Origin header sent with every bridge request
    #[serde(default = "TrezorConfig::default_origin")]
    pub origin: String,

    /// Timeout of the bridge version check (ms)
    #[serde(default = "TrezorConfig::default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Timeout of a single `/call` round-trip (ms), covers user interaction
    #[serde(default = "TrezorConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl TrezorConfig {
    fn default_bridge_url() -> String { "http://127.0.0.1:21325".to_string() }
    fn default_origin() -> String { "https://blocksettle.trezor.io".to_string() }
    fn default_init_timeout_ms() -> u64 { 2_000 }
    fn default_call_timeout_ms() -> u64 { 300_000 }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for TrezorConfig {
    fn default() -> Self {
        Self {
            bridge_url: Self::default_bridge_url(),
            origin: Self::default_origin(),
            init_timeout_ms: Self::default_init_timeout_ms(),
            call_timeout_ms: Self::default_call_timeout_ms(),
        }
    }
}

/// Ledger HID configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    /// Per-APDU read timeout (ms)
    #[serde(default = "LedgerConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl LedgerConfig {
    fn default_read_timeout_ms() -> u64 { 30_000 }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { read_timeout_ms: Self::default_read_timeout_ms() }
    }
}

/// Jade serial configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JadeConfig {
    #[serde(default = "JadeConfig::default_baud_rate")]
    pub baud_rate: u32,

    /// Timeout of a single RPC request (ms)
    #[serde(default = "JadeConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl JadeConfig {
    fn default_baud_rate() -> u32 { 115_200 }
    fn default_request_timeout_ms() -> u64 { 300_000 }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for JadeConfig {
    fn default() -> Self {
        Self {
            baud_rate: Self::default_baud_rate(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

/// Worker pool sizing, shared by every device client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_pool_size")]
    pub pool_size: usize,

    /// Bounded submission queue
    #[serde(default = "WorkerConfig::default_queue_depth")]
    pub queue_depth: usize,
}

impl WorkerConfig {
    fn default_pool_size() -> usize { 1 }
    fn default_queue_depth() -> usize { 32 }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            queue_depth: Self::default_queue_depth(),
        }
    }
}

/// Top-level device layer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HwConfig {
    /// Selects coin type 1' and testnet xpub versions
    #[serde(default)]
    pub testnet: bool,

    #[serde(default)]
    pub trezor: TrezorConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub jade: JadeConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    /// Upper bound for a whole device operation (s)
    #[serde(default = "HwConfig::default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl HwConfig {
    fn default_operation_timeout_secs() -> u64 { 600 }

    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> HwResult<Self> {
        let config: HwConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> HwResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HwError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `HWW_BRIDGE_URL`, `HWW_BRIDGE_ORIGIN` and `HWW_TESTNET` on top of the file values
    pub fn apply_env_overrides(&mut self) -> HwResult<()> {
        if let Ok(url) = std::env::var("HWW_BRIDGE_URL") {
            self.trezor.bridge_url = url;
        }
        if let Ok(origin) = std::env::var("HWW_BRIDGE_ORIGIN") {
            self.trezor.origin = origin;
        }
        if let Ok(flag) = std::env::var("HWW_TESTNET") {
            self.testnet = match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => return Err(HwError::Config(format!("HWW_TESTNET: unexpected value '{}'", other))),
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> HwResult<()> {
        if self.workers.pool_size == 0 {
            return Err(HwError::Config("workers.pool_size must be at least 1".into()));
        }
        if self.workers.queue_depth == 0 {
            return Err(HwError::Config("workers.queue_depth must be at least 1".into()));
        }
        if !self.trezor.bridge_url.starts_with("http://")
            && !self.trezor.bridge_url.starts_with("https://")
        {
            return Err(HwError::Config(format!(
                "trezor.bridge_url is not an http url: {}",
                self.trezor.bridge_url
            )));
        }
        if self.jade.baud_rate == 0 {
            return Err(HwError::Config("jade.baud_rate must be positive".into()));
        }
        if self.trezor.init_timeout_ms == 0
            || self.trezor.call_timeout_ms == 0
            || self.ledger.read_timeout_ms == 0
            || self.jade.request_timeout_ms == 0
            || self.operation_timeout_secs == 0
        {
            return Err(HwError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            trezor: TrezorConfig::default(),
            ledger: LedgerConfig::default(),
            jade: JadeConfig::default(),
            workers: WorkerConfig::default(),
            operation_timeout_secs: Self::default_operation_timeout_secs(),
        }
    }
}
