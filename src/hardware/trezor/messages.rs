//! Trezor protobuf messages and bridge framing
//!
//! Only the subset of the trezor-common schema needed for public key export
//! and Bitcoin signing is declared here.

use crate::core::errors::{HwError, HwResult};
use prost::Message;
use std::fmt;

/// Wire identifiers from `messages.proto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Initialize = 0,
    Success = 2,
    Failure = 3,
    GetPublicKey = 11,
    PublicKey = 12,
    SignTx = 15,
    Features = 17,
    PinMatrixRequest = 18,
    PinMatrixAck = 19,
    Cancel = 20,
    TxRequest = 21,
    TxAck = 22,
    ButtonRequest = 26,
    ButtonAck = 27,
    PassphraseRequest = 41,
    PassphraseAck = 42,
    GetFeatures = 55,
    EndSession = 83,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            2 => Some(Self::Success),
            3 => Some(Self::Failure),
            11 => Some(Self::GetPublicKey),
            12 => Some(Self::PublicKey),
            15 => Some(Self::SignTx),
            17 => Some(Self::Features),
            18 => Some(Self::PinMatrixRequest),
            19 => Some(Self::PinMatrixAck),
            20 => Some(Self::Cancel),
            21 => Some(Self::TxRequest),
            22 => Some(Self::TxAck),
            26 => Some(Self::ButtonRequest),
            27 => Some(Self::ButtonAck),
            41 => Some(Self::PassphraseRequest),
            42 => Some(Self::PassphraseAck),
            55 => Some(Self::GetFeatures),
            83 => Some(Self::EndSession),
            _ => None,
        }
    }
}

/// Typed message with its wire id
pub trait TrezorProto: Message + Default {
    const TYPE: MessageType;
}

/// One framed message as exchanged with the bridge
#[derive(Clone, PartialEq, Eq)]
pub struct TrezorMessage {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl fmt::Debug for TrezorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrezorMessage")
            .field("msg_type", &self.kind().map_or_else(|| self.msg_type.to_string(), |t| format!("{:?}", t)))
            .field("len", &self.payload.len())
            .finish()
    }
}

impl TrezorMessage {
    pub fn new<M: TrezorProto>(message: &M) -> Self {
        Self { msg_type: M::TYPE as u16, payload: message.encode_to_vec() }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }

    pub fn is<M: TrezorProto>(&self) -> bool {
        self.msg_type == M::TYPE as u16
    }

    pub fn decode<M: TrezorProto>(&self) -> HwResult<M> {
        if !self.is::<M>() {
            return Err(HwError::Protocol(format!(
                "expected {:?}, device answered {:?}",
                M::TYPE,
                self
            )));
        }
        Ok(M::decode(self.payload.as_slice())?)
    }

    /// 4 hex chars type, 8 hex chars length, hex payload
    pub fn pack(&self) -> String {
        format!("{:04x}{:08x}{}", self.msg_type, self.payload.len(), hex::encode(&self.payload))
    }

    pub fn unpack(raw: &str) -> HwResult<Self> {
        let raw = raw.trim();
        if raw.len() < 12 || !raw.is_ascii() {
            return Err(HwError::Protocol(format!("bridge frame too short: {} chars", raw.len())));
        }
        let msg_type = u16::from_str_radix(&raw[..4], 16)
            .map_err(|e| HwError::Protocol(format!("bad message type: {}", e)))?;
        let len = usize::from_str_radix(&raw[4..12], 16)
            .map_err(|e| HwError::Protocol(format!("bad message length: {}", e)))?;
        let payload = hex::decode(&raw[12..])?;
        if payload.len() != len {
            return Err(HwError::Protocol(format!(
                "bridge frame length mismatch: header {}, payload {}",
                len,
                payload.len()
            )));
        }
        Ok(Self { msg_type, payload })
    }
}

macro_rules! trezor_proto {
    ($($ty:ident),* $(,)?) => {
        $(impl TrezorProto for $ty {
            const TYPE: MessageType = MessageType::$ty;
        })*
    };
}

trezor_proto!(
    Initialize,
    Success,
    Failure,
    GetPublicKey,
    PublicKey,
    SignTx,
    Features,
    PinMatrixRequest,
    PinMatrixAck,
    Cancel,
    TxRequest,
    TxAck,
    ButtonRequest,
    ButtonAck,
    PassphraseRequest,
    PassphraseAck,
    GetFeatures,
    EndSession,
);

#[derive(Clone, PartialEq, Message)]
pub struct Initialize {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub session_id: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetFeatures {}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(string, optional, tag = "1")]
    pub vendor: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub major_version: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub minor_version: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub patch_version: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub bootloader_mode: Option<bool>,
    #[prost(string, optional, tag = "6")]
    pub device_id: Option<String>,
    #[prost(bool, optional, tag = "7")]
    pub pin_protection: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub passphrase_protection: Option<bool>,
    #[prost(string, optional, tag = "10")]
    pub label: Option<String>,
    #[prost(bool, optional, tag = "12")]
    pub initialized: Option<bool>,
    #[prost(bool, optional, tag = "16")]
    pub unlocked: Option<bool>,
    #[prost(string, optional, tag = "21")]
    pub model: Option<String>,
}

impl Features {
    pub fn version(&self) -> (u32, u32, u32) {
        (
            self.major_version.unwrap_or_default(),
            self.minor_version.unwrap_or_default(),
            self.patch_version.unwrap_or_default(),
        )
    }

    pub fn version_string(&self) -> String {
        let (major, minor, patch) = self.version();
        format!("{}.{}.{}", major, minor, patch)
    }

    /// Model "1" has no passphrase entry on the device
    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("1")
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct EndSession {}

#[derive(Clone, PartialEq, Message)]
pub struct Cancel {}

#[derive(Clone, PartialEq, Message)]
pub struct Success {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Failure {
    #[prost(enumeration = "FailureType", optional, tag = "1")]
    pub code: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FailureType {
    UnexpectedMessage = 1,
    ButtonExpected = 2,
    DataError = 3,
    ActionCancelled = 4,
    PinExpected = 5,
    PinCancelled = 6,
    PinInvalid = 7,
    InvalidSignature = 8,
    ProcessError = 9,
    NotEnoughFunds = 10,
    NotInitialized = 11,
    PinMismatch = 12,
    WipeCodeMismatch = 13,
    InvalidSession = 14,
    FirmwareError = 99,
}

impl Failure {
    pub fn into_error(self) -> HwError {
        match self.code.and_then(FailureType::from_i32) {
            Some(FailureType::ActionCancelled) | Some(FailureType::PinCancelled) => {
                HwError::CancelledOnDevice
            }
            Some(FailureType::PinInvalid) => HwError::InvalidPin,
            code => HwError::Protocol(format!(
                "device failure {:?}: {}",
                code,
                self.message.unwrap_or_default()
            )),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ButtonRequest {
    #[prost(uint32, optional, tag = "1")]
    pub code: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub pages: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ButtonAck {}

#[derive(Clone, PartialEq, Message)]
pub struct PinMatrixRequest {
    #[prost(uint32, optional, tag = "1")]
    pub r#type: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PinMatrixAck {
    #[prost(string, required, tag = "1")]
    pub pin: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseRequest {
    #[prost(bool, optional, tag = "1")]
    pub on_device: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseAck {
    #[prost(string, optional, tag = "1")]
    pub passphrase: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub on_device: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HdNodeType {
    #[prost(uint32, required, tag = "1")]
    pub depth: u32,
    #[prost(uint32, required, tag = "2")]
    pub fingerprint: u32,
    #[prost(uint32, required, tag = "3")]
    pub child_num: u32,
    #[prost(bytes = "vec", required, tag = "4")]
    pub chain_code: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "6")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPublicKey {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bool, optional, tag = "3")]
    pub show_display: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub coin_name: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PublicKey {
    #[prost(message, optional, tag = "1")]
    pub node: Option<HdNodeType>,
    #[prost(string, required, tag = "2")]
    pub xpub: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum InputScriptType {
    SpendAddress = 0,
    SpendMultisig = 1,
    External = 2,
    SpendWitness = 3,
    SpendP2shWitness = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OutputScriptType {
    PayToAddress = 0,
    PayToScriptHash = 1,
    PayToMultisig = 2,
    PayToOpReturn = 3,
    PayToWitness = 4,
    PayToP2shWitness = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignTx {
    #[prost(uint32, required, tag = "1")]
    pub outputs_count: u32,
    #[prost(uint32, required, tag = "2")]
    pub inputs_count: u32,
    #[prost(string, optional, tag = "3")]
    pub coin_name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub version: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub lock_time: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequest {
    #[prost(enumeration = "RequestType", optional, tag = "1")]
    pub request_type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub details: Option<TxRequestDetails>,
    #[prost(message, optional, tag = "3")]
    pub serialized: Option<TxRequestSerialized>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    TxInput = 0,
    TxOutput = 1,
    TxMeta = 2,
    TxFinished = 3,
    TxExtraData = 4,
    TxOrigInput = 5,
    TxOrigOutput = 6,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequestDetails {
    #[prost(uint32, optional, tag = "1")]
    pub request_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub tx_hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequestSerialized {
    #[prost(uint32, optional, tag = "1")]
    pub signature_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub serialized_tx: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxAck {
    #[prost(message, optional, tag = "1")]
    pub tx: Option<TransactionType>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionType {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<TxInputType>,
    #[prost(message, repeated, tag = "3")]
    pub bin_outputs: Vec<TxOutputBinType>,
    #[prost(uint32, optional, tag = "4")]
    pub lock_time: Option<u32>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<TxOutputType>,
    #[prost(uint32, optional, tag = "6")]
    pub inputs_cnt: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub outputs_cnt: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxInputType {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub prev_hash: Vec<u8>,
    #[prost(uint32, required, tag = "3")]
    pub prev_index: u32,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub script_sig: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub sequence: Option<u32>,
    #[prost(enumeration = "InputScriptType", optional, tag = "6")]
    pub script_type: Option<i32>,
    #[prost(uint64, optional, tag = "8")]
    pub amount: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxOutputBinType {
    #[prost(uint64, required, tag = "1")]
    pub amount: u64,
    #[prost(bytes = "vec", required, tag = "2")]
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxOutputType {
    #[prost(string, optional, tag = "1")]
    pub address: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub address_n: Vec<u32>,
    #[prost(uint64, required, tag = "3")]
    pub amount: u64,
    #[prost(enumeration = "OutputScriptType", optional, tag = "4")]
    pub script_type: Option<i32>,
}
