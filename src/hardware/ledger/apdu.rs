//! APDU commands for the Ledger Bitcoin app

use crate::core::errors::{HwError, HwResult};
use tracing::debug;

pub const CLA: u8 = 0xE0;

/// Bitcoin app instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduInstruction {
    GetWalletPublicKey = 0x40,
    GetTrustedInput = 0x42,
    HashInputStart = 0x44,
    HashInputFinalize = 0x46,
    HashSign = 0x48,
    HashInputFinalizeFull = 0x4A,
    GetFirmwareVersion = 0xC4,
}

pub const SW_OK: u16 = 0x9000;
pub const SW_UNKNOWN: u16 = 0x6D00;
pub const SW_NO_ENVIRONMENT: u16 = 0x6982;
pub const SW_CANCELED_BY_USER: u16 = 0x6985;
pub const SW_RECONNECT_DEVICE: u16 = 0x6FAA;

/// Largest data field a short APDU can carry
pub const MAX_APDU_DATA: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(ins: ApduInstruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self { cla: CLA, ins: ins as u8, p1, p2, data }
    }

    /// CLA INS P1 P2 Lc data
    pub fn encode(&self) -> HwResult<Vec<u8>> {
        if self.data.len() > MAX_APDU_DATA {
            return Err(HwError::Protocol(format!(
                "APDU data too long: {} bytes (INS={:02X})",
                self.data.len(),
                self.ins
            )));
        }
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        bytes.extend_from_slice(&self.data);

        debug!(
            "APDU: CLA={:02X} INS={:02X} P1={:02X} P2={:02X} Lc={}",
            self.cla, self.ins, self.p1, self.p2, self.data.len()
        );
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ApduResponse {
    /// Response body with the status word in the last two bytes
    pub fn from_bytes(bytes: &[u8]) -> HwResult<Self> {
        if bytes.len() < 2 {
            return Err(HwError::Protocol(format!("APDU response too short: {} bytes", bytes.len())));
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        let sw = u16::from_be_bytes([sw[0], sw[1]]);
        debug!("APDU response: SW={:04X} len={}", sw, data.len());
        Ok(Self { data: data.to_vec(), sw })
    }

    pub fn is_success(&self) -> bool {
        self.sw == SW_OK
    }

    /// Map a non-OK status word to an error
    pub fn check(self) -> HwResult<Vec<u8>> {
        match self.sw {
            SW_OK => Ok(self.data),
            SW_CANCELED_BY_USER => Err(HwError::CancelledOnDevice),
            sw => Err(HwError::Apdu { sw, reason: status_description(sw).to_string() }),
        }
    }
}

pub fn status_description(sw: u16) -> &'static str {
    match sw {
        SW_OK => "success",
        SW_UNKNOWN => "unknown command, is the Bitcoin app open?",
        SW_NO_ENVIRONMENT => "no environment, unlock the device and open the Bitcoin app",
        SW_CANCELED_BY_USER => "cancelled by user",
        SW_RECONNECT_DEVICE => "reconnect the device",
        0x6A80 => "invalid data",
        0x6B00 => "incorrect parameters",
        0x6E00 => "unsupported class, is the Bitcoin app open?",
        _ => "unexpected status",
    }
}
