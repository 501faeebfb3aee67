// src/core/mod.rs

pub mod bip32;
pub mod config;
pub mod errors;
pub mod signing;
pub mod tx_request;
pub mod types;
pub mod wallet;

pub use config::HwConfig;
pub use errors::{HwError, HwResult};
pub use types::{DeviceKey, DeviceType, HwWalletInfo};
