//! Ledger Nano S / Nano X over HID, Bitcoin app APDUs

pub mod apdu;
pub mod bitcoin_app;
pub mod client;
pub mod device;
pub mod framing;
pub mod transport;

pub use client::LedgerClient;
pub use device::LedgerDevice;
pub use transport::{HidDeviceInfo, HidEnumerator, LedgerModel, LedgerTransport};

use apdu::ApduResponse;
use crate::core::errors::HwResult;
use crate::tools::worker_pool::WorkerPool;
use transport::ApduJob;

pub type ApduPool = WorkerPool<ApduJob, HwResult<ApduResponse>>;
