//! HID report framing for APDUs
//!
//! Every 64-byte report starts with channel (u16 BE), tag and sequence
//! (u16 BE). The first report of a message also carries the total length.

use crate::core::errors::{HwError, HwResult};
use bytes::{BufMut, BytesMut};
use tracing::debug;

pub const HID_REPORT_SIZE: usize = 64;
pub const CHANNEL: u16 = 0x0101;
pub const TAG_APDU: u8 = 0x05;

const HEADER_LEN: usize = 5;
const FIRST_PAYLOAD: usize = HID_REPORT_SIZE - HEADER_LEN - 2;
const NEXT_PAYLOAD: usize = HID_REPORT_SIZE - HEADER_LEN;

/// Split an encoded APDU into write-ready reports (report id 0x00 prepended)
pub fn build_reports(apdu: &[u8]) -> Vec<Vec<u8>> {
    let mut reports = Vec::new();
    let mut offset = 0;
    let mut sequence: u16 = 0;

    loop {
        let mut report = BytesMut::with_capacity(HID_REPORT_SIZE + 1);
        report.put_u8(0x00);
        report.put_u16(CHANNEL);
        report.put_u8(TAG_APDU);
        report.put_u16(sequence);

        let capacity = if sequence == 0 {
            report.put_u16(apdu.len() as u16);
            FIRST_PAYLOAD
        } else {
            NEXT_PAYLOAD
        };
        let chunk = capacity.min(apdu.len() - offset);
        report.put_slice(&apdu[offset..offset + chunk]);
        offset += chunk;

        report.resize(HID_REPORT_SIZE + 1, 0);
        reports.push(report.to_vec());
        sequence += 1;

        if offset >= apdu.len() {
            break;
        }
    }
    reports
}

/// Reassembles a response from incoming reports
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    sequence: u16,
    expected: Option<usize>,
    data: BytesMut,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one report as read from the device; returns the full response
    /// (data followed by the status word) once complete
    pub fn push(&mut self, report: &[u8]) -> HwResult<Option<Vec<u8>>> {
        if report.len() < HEADER_LEN + 2 {
            return Err(HwError::Protocol(format!("HID report too short: {} bytes", report.len())));
        }
        let channel = u16::from_be_bytes([report[0], report[1]]);
        if channel != CHANNEL || report[2] != TAG_APDU {
            debug!("skipping report for channel {:04X} tag {:02X}", channel, report[2]);
            return Ok(None);
        }
        let sequence = u16::from_be_bytes([report[3], report[4]]);
        if sequence != self.sequence {
            return Err(HwError::Protocol(format!(
                "HID sequence mismatch: expected {}, got {}",
                self.sequence, sequence
            )));
        }

        let payload = if sequence == 0 {
            self.expected = Some(u16::from_be_bytes([report[5], report[6]]) as usize);
            &report[HEADER_LEN + 2..]
        } else {
            &report[HEADER_LEN..]
        };
        self.data.put_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);

        match self.expected {
            Some(len) if self.data.len() >= len => {
                if len < 2 {
                    return Err(HwError::Protocol("response shorter than a status word".into()));
                }
                self.data.truncate(len);
                Ok(Some(self.data.split().to_vec()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frame a device response the way the device does (no report id)
    fn device_reports(response: &[u8]) -> Vec<Vec<u8>> {
        build_reports(response).into_iter().map(|r| r[1..].to_vec()).collect()
    }

    #[test]
    fn test_single_report_layout() {
        let reports = build_reports(&[0xE0, 0xC4, 0x00, 0x00, 0x00]);
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.len(), 65);
        assert_eq!(&r[..8], &[0x00, 0x01, 0x01, 0x05, 0x00, 0x00, 0x00, 0x05]);
        assert_eq!(&r[8..13], &[0xE0, 0xC4, 0x00, 0x00, 0x00]);
        assert!(r[13..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_split_boundaries() {
        assert_eq!(build_reports(&[1u8; 57]).len(), 1);
        assert_eq!(build_reports(&[1u8; 58]).len(), 2);
        assert_eq!(build_reports(&[1u8; 57 + 59]).len(), 2);
        let reports = build_reports(&[1u8; 57 + 60]);
        assert_eq!(reports.len(), 3);
        assert_eq!(&reports[2][4..6], &[0x00, 0x02]);
    }

    #[test]
    fn test_reassembly() {
        let mut response: Vec<u8> = (0..200u8).collect();
        response.extend_from_slice(&[0x90, 0x00]);

        let mut assembler = ResponseAssembler::new();
        let reports = device_reports(&response);
        let mut out = None;
        for (i, report) in reports.iter().enumerate() {
            out = assembler.push(report).unwrap();
            assert_eq!(out.is_some(), i == reports.len() - 1);
        }
        assert_eq!(out.unwrap(), response);
    }

    #[test]
    fn test_sequence_mismatch() {
        let reports = device_reports(&[0u8; 100]);
        let mut assembler = ResponseAssembler::new();
        assert!(assembler.push(&reports[1]).is_err());
    }
}
