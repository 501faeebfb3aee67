//! Jade CBOR RPC messages
//!
//! Requests are CBOR maps `{id, method, params?}`. The device answers with
//! `{id, result}` or `{id, error}` and interleaves `{log}` maps that belong
//! to no request.

use crate::core::errors::{HwError, HwResult};
use ciborium::value::Value;
use serde::{Deserialize, Serialize, Serializer};
use std::io::{Cursor, ErrorKind};

pub const NETWORK_MAINNET: &str = "mainnet";
pub const NETWORK_TESTNET: &str = "testnet";

pub const RPC_USER_CANCELLED: i64 = -32000;
pub const RPC_PROTOCOL_ERROR: i64 = -32001;
pub const RPC_HW_LOCKED: i64 = -32002;
pub const RPC_NETWORK_MISMATCH: i64 = -32003;

pub fn network(testnet: bool) -> &'static str {
    if testnet {
        NETWORK_TESTNET
    } else {
        NETWORK_MAINNET
    }
}

/// Byte string on the wire, `Vec<u8>` alone would encode as an array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CborBytes(pub Vec<u8>);

impl Serialize for CborBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

#[derive(Debug, Serialize)]
pub struct JadeRequest<'a, P> {
    pub id: String,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a P>,
}

impl<'a, P: Serialize> JadeRequest<'a, P> {
    pub fn encode(&self) -> HwResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|e| HwError::Serialization(format!("failed to encode {}: {}", self.method, e)))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JadeRpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl JadeRpcError {
    pub fn into_error(self) -> HwError {
        match self.code {
            RPC_USER_CANCELLED => HwError::CancelledOnDevice,
            RPC_HW_LOCKED => HwError::DeviceLocked(self.message),
            RPC_NETWORK_MISMATCH => HwError::InvalidRequest(format!("Jade network mismatch: {}", self.message)),
            code => HwError::Protocol(format!("Jade error {}: {}", code, self.message)),
        }
    }
}

/// Any map the device sends
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JadeResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JadeRpcError>,
    #[serde(default)]
    pub log: Option<Value>,
}

impl JadeResponse {
    pub fn from_value(value: &Value) -> HwResult<Self> {
        value
            .deserialized()
            .map_err(|e| HwError::Protocol(format!("unexpected Jade message: {}", e)))
    }

    pub fn is_log(&self) -> bool {
        self.id.is_none() && self.log.is_some()
    }

    pub fn into_result(self) -> HwResult<Value> {
        if let Some(error) = self.error {
            return Err(error.into_error());
        }
        self.result
            .ok_or_else(|| HwError::Protocol("Jade reply carries neither result nor error".into()))
    }
}

/// Reply to `get_version_info`, unknown keys ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "JADE_VERSION")]
    pub version: String,
    #[serde(rename = "JADE_STATE")]
    pub state: String,
    #[serde(rename = "EFUSEMAC")]
    pub efusemac: String,
    #[serde(rename = "JADE_NETWORKS", default)]
    pub networks: Option<String>,
    #[serde(rename = "BOARD_TYPE", default)]
    pub board_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JadeState {
    /// Unlocked, wallet loaded
    Ready,
    Locked,
    Uninit,
    Unsaved,
    /// Temporary signer from a scanned seed
    Temp,
    Other(String),
}

impl JadeState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "READY" => JadeState::Ready,
            "LOCKED" => JadeState::Locked,
            "UNINIT" => JadeState::Uninit,
            "UNSAVED" => JadeState::Unsaved,
            "TEMP" => JadeState::Temp,
            other => JadeState::Other(other.to_string()),
        }
    }

    pub fn has_wallet(&self) -> bool {
        matches!(self, JadeState::Ready | JadeState::Temp)
    }
}

impl VersionInfo {
    pub fn state(&self) -> JadeState {
        JadeState::parse(&self.state)
    }
}

#[derive(Debug, Serialize)]
pub struct AuthUserParams<'a> {
    pub network: &'a str,
    pub epoch: u64,
}

#[derive(Debug, Serialize)]
pub struct GetXpubParams<'a> {
    pub network: &'a str,
    pub path: Vec<u32>,
}

/// Change output description, `None` for outputs that are not ours
#[derive(Debug, Clone, Serialize)]
pub struct ChangeInfo {
    pub path: Vec<u32>,
    pub variant: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SignTxParams<'a> {
    pub network: &'a str,
    pub txn: CborBytes,
    pub num_inputs: u32,
    pub use_ae_signatures: bool,
    pub change: Vec<Option<ChangeInfo>>,
}

#[derive(Debug, Serialize)]
pub struct TxInputParams {
    pub is_witness: bool,
    pub path: Vec<u32>,
    /// Script code for segwit, spent script for legacy
    pub script: CborBytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satoshi: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tx: Option<CborBytes>,
}

pub fn expect_text(value: Value, what: &str) -> HwResult<String> {
    match value {
        Value::Text(text) => Ok(text),
        other => Err(HwError::Protocol(format!("expected text for {}, got {:?}", what, other))),
    }
}

pub fn expect_bytes(value: Value, what: &str) -> HwResult<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        other => Err(HwError::Protocol(format!("expected bytes for {}, got {:?}", what, other))),
    }
}

/// Splits a serial byte stream into CBOR values
#[derive(Debug, Default)]
pub struct CborStreamDecoder {
    buffer: Vec<u8>,
}

impl CborStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete value; `None` while the buffered object is incomplete.
    /// Undecodable input clears the buffer.
    pub fn next_value(&mut self) -> HwResult<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(self.buffer.as_slice());
        match ciborium::de::from_reader::<Value, _>(&mut cursor) {
            Ok(value) => {
                let used = cursor.position() as usize;
                self.buffer.drain(..used);
                Ok(Some(value))
            }
            Err(ciborium::de::Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => {
                self.buffer.clear();
                Err(HwError::Protocol(format!("invalid CBOR from Jade: {}", e)))
            }
        }
    }
}
