#![allow(clippy::needless_return)]
#![allow(clippy::len_zero)]
// src/lib.rs
//! Hardware wallet device layer
//!
//! Trezor (bridge + protobuf), Ledger (HID + APDU) and Jade (serial + CBOR)
//! drivers behind a single `DeviceManager`.

pub mod core;
pub mod hardware;
pub mod tools;

pub use crate::core::{DeviceKey, DeviceType, HwConfig, HwError, HwResult, HwWalletInfo};
pub use crate::hardware::{DeviceCallbacks, DeviceEvent, DeviceManager};
