//! Ledger HID transport
//!
//! All HID traffic goes through one `HidBus`; concurrent transfers to
//! different Ledgers are serialized. Exchanges are blocking and run on the
//! client's worker pool via `ApduWorker`.

use super::apdu::{ApduCommand, ApduResponse};
#[cfg(feature = "ledger")]
use super::framing::{build_reports, ResponseAssembler, HID_REPORT_SIZE};
use crate::core::errors::{HwError, HwResult};
use crate::tools::worker_pool::Worker;
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "ledger")]
use tracing::{debug, info};

pub const LEDGER_NANO_S_VENDOR_ID: u16 = 0x2C97;
pub const LEDGER_NANO_X_VENDOR_ID: u16 = 0x2581;
pub const LEDGER_NANO_X_PRODUCT_IDS: [u16; 4] = [0x2B7C, 0x3B7C, 0x4B7C, 0x1807];
pub const LEDGER_USAGE_PAGE: u16 = 0xFFA0;
pub const LEDGER_INTERFACE: i32 = 0;

/// One APDU round-trip
pub trait LedgerTransport: Send {
    fn exchange(&mut self, command: &ApduCommand) -> HwResult<ApduResponse>;

    fn close(&mut self) {}
}

pub type SharedTransport = Arc<Mutex<Box<dyn LedgerTransport>>>;

/// Process-wide HID lock
#[derive(Clone, Default)]
pub struct HidBus {
    lock: Arc<Mutex<()>>,
}

impl HidBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerModel {
    NanoS,
    NanoX,
}

impl LedgerModel {
    pub fn label(&self) -> &'static str {
        match self {
            LedgerModel::NanoS => "Nano S",
            LedgerModel::NanoX => "Nano X",
        }
    }
}

/// Enumerated HID interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: i32,
    /// Zero when the platform does not report it
    pub usage_page: u16,
    pub serial: Option<String>,
    pub product: Option<String>,
}

impl HidDeviceInfo {
    /// Serial when reported, otherwise the HID path
    pub fn device_id(&self) -> String {
        match &self.serial {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => self.path.clone(),
        }
    }
}

/// Nano S and Nano X criteria are mutually exclusive
pub fn classify(info: &HidDeviceInfo) -> Option<LedgerModel> {
    if info.interface_number != LEDGER_INTERFACE {
        return None;
    }
    if info.usage_page != 0 && info.usage_page != LEDGER_USAGE_PAGE {
        return None;
    }
    let nano_s = info.vendor_id == LEDGER_NANO_S_VENDOR_ID;
    let nano_x = info.vendor_id == LEDGER_NANO_X_VENDOR_ID
        && LEDGER_NANO_X_PRODUCT_IDS.contains(&info.product_id);
    match (nano_s, nano_x) {
        (true, false) => Some(LedgerModel::NanoS),
        (false, true) => Some(LedgerModel::NanoX),
        _ => None,
    }
}

pub trait HidEnumerator: Send + Sync {
    fn enumerate(&self) -> HwResult<Vec<HidDeviceInfo>>;

    fn open(&self, info: &HidDeviceInfo, read_timeout: Duration) -> HwResult<Box<dyn LedgerTransport>>;
}

/// Enumerator that never finds anything, used when HID support is compiled out
pub struct NoHid;

impl HidEnumerator for NoHid {
    fn enumerate(&self) -> HwResult<Vec<HidDeviceInfo>> {
        Ok(Vec::new())
    }

    fn open(&self, info: &HidDeviceInfo, _read_timeout: Duration) -> HwResult<Box<dyn LedgerTransport>> {
        Err(HwError::DeviceNotFound(info.path.clone()))
    }
}

#[cfg(feature = "ledger")]
pub use hid::{HidApiEnumerator, HidTransport};

#[cfg(feature = "ledger")]
mod hid {
    use super::*;
    use hidapi::{HidApi, HidDevice};
    use std::ffi::CString;

    pub struct HidApiEnumerator {
        bus: HidBus,
        api: Mutex<Option<HidApi>>,
    }

    impl HidApiEnumerator {
        pub fn new(bus: HidBus) -> Self {
            Self { bus, api: Mutex::new(None) }
        }

        fn with_api<T>(&self, f: impl FnOnce(&mut HidApi) -> HwResult<T>) -> HwResult<T> {
            let _bus = self.bus.lock();
            let mut api = self.api.lock();
            if api.is_none() {
                *api = Some(HidApi::new()?);
            }
            match api.as_mut() {
                Some(api) => f(api),
                None => Err(HwError::Transport("HID API unavailable".into())),
            }
        }
    }

    impl HidEnumerator for HidApiEnumerator {
        fn enumerate(&self) -> HwResult<Vec<HidDeviceInfo>> {
            self.with_api(|api| {
                api.refresh_devices()?;
                Ok(api
                    .device_list()
                    .map(|d| HidDeviceInfo {
                        path: d.path().to_string_lossy().into_owned(),
                        vendor_id: d.vendor_id(),
                        product_id: d.product_id(),
                        interface_number: d.interface_number(),
                        usage_page: d.usage_page(),
                        serial: d.serial_number().map(str::to_string),
                        product: d.product_string().map(str::to_string),
                    })
                    .collect())
            })
        }

        fn open(&self, info: &HidDeviceInfo, read_timeout: Duration) -> HwResult<Box<dyn LedgerTransport>> {
            let path = CString::new(info.path.clone())
                .map_err(|_| HwError::Transport(format!("invalid HID path: {}", info.path)))?;
            let device = self.with_api(|api| Ok(api.open_path(&path)?))?;
            info!("✅ Opened Ledger HID device {}", info.path);
            Ok(Box::new(HidTransport { device, bus: self.bus.clone(), read_timeout }))
        }
    }

    pub struct HidTransport {
        device: HidDevice,
        bus: HidBus,
        read_timeout: Duration,
    }

    impl LedgerTransport for HidTransport {
        fn exchange(&mut self, command: &ApduCommand) -> HwResult<ApduResponse> {
            let encoded = command.encode()?;
            let _bus = self.bus.lock();

            for report in build_reports(&encoded) {
                self.device.write(&report)?;
            }

            let mut assembler = ResponseAssembler::new();
            let timeout_ms = self.read_timeout.as_millis().min(i32::MAX as u128) as i32;
            loop {
                let mut buf = [0u8; HID_REPORT_SIZE];
                let read = self.device.read_timeout(&mut buf, timeout_ms)?;
                if read == 0 {
                    return Err(HwError::Timeout(format!(
                        "no HID response within {:?}",
                        self.read_timeout
                    )));
                }
                if let Some(raw) = assembler.push(&buf[..read])? {
                    let response = ApduResponse::from_bytes(&raw)?;
                    debug!(ins = command.ins, sw = response.sw, "APDU exchanged");
                    return Ok(response);
                }
            }
        }
    }
}

/// Blocking exchange handed to the worker pool
pub struct ApduJob {
    pub transport: SharedTransport,
    pub command: ApduCommand,
}

pub struct ApduWorker;

#[async_trait]
impl Worker<ApduJob, HwResult<ApduResponse>> for ApduWorker {
    async fn process(&self, job: ApduJob) -> HwResult<ApduResponse> {
        tokio::task::spawn_blocking(move || job.transport.lock().exchange(&job.command))
            .await
            .map_err(|e| HwError::Internal(format!("HID exchange task failed: {}", e)))?
    }
}
