// tests/util.rs
// Shared helpers for the device integration tests: a software key tree,
// sign request fixtures and scripted fakes of the Ledger HID endpoint, the
// Trezor bridge and a Jade on a serial port.
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use ciborium::value::Value;
use hww_core::core::bip32::{Bip32Path, Purpose};
use hww_core::core::config::HwConfig;
use hww_core::core::errors::{HwError, HwResult};
use hww_core::core::signing::{finalize_transaction, InputSignature};
use hww_core::core::tx_request::{script_for, ChangeOutput, Recipient, TxSignRequest, Utxo};
use hww_core::core::wallet::InMemoryWallet;
use hww_core::hardware::jade::messages::CborStreamDecoder;
use hww_core::hardware::jade::{JadePort, JadePortScanner, JadeStream};
use hww_core::hardware::ledger::apdu::{ApduCommand, ApduResponse, SW_CANCELED_BY_USER, SW_OK};
use hww_core::hardware::ledger::{HidDeviceInfo, HidEnumerator, LedgerTransport};
use hww_core::hardware::trezor::bitcoin_app::display_hash;
use hww_core::hardware::trezor::messages::{
    ButtonRequest, Failure, FailureType, Features, GetPublicKey, MessageType, PinMatrixAck,
    PinMatrixRequest, PublicKey as TrezorPublicKey, RequestType, Success, TxAck, TxRequest,
    TxRequestDetails, TxRequestSerialized,
};
use hww_core::hardware::trezor::{BridgeRequest, TrezorMessage};
use hww_core::hardware::DeviceEvent;
use hww_core::tools::worker_pool::Worker;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WALLET_ID: &str = "wallet-1";

/// Software stand-in for the seed held by a device
pub struct KeyTree {
    master: Xpriv,
}

impl KeyTree {
    pub fn new(seed: &[u8]) -> Self {
        Self { master: Xpriv::new_master(Network::Bitcoin, seed).unwrap() }
    }

    pub fn xpriv(&self, path: &[u32]) -> Xpriv {
        let children: Vec<ChildNumber> = path.iter().map(|index| ChildNumber::from(*index)).collect();
        self.master.derive_priv(&Secp256k1::new(), &children).unwrap()
    }

    pub fn xpub(&self, path: &[u32]) -> Xpub {
        Xpub::from_priv(&Secp256k1::new(), &self.xpriv(path))
    }

    pub fn secret(&self, path: &[u32]) -> SecretKey {
        self.xpriv(path).private_key
    }

    pub fn pubkey(&self, path: &[u32]) -> Vec<u8> {
        self.xpub(path).public_key.serialize().to_vec()
    }

    pub fn root_xpub(&self) -> String {
        self.xpub(&Bip32Path::root().path).to_string()
    }

    pub fn account_xpub(&self, purpose: Purpose) -> String {
        self.xpub(&Bip32Path::account(purpose, false).path).to_string()
    }
}

pub fn device_keys() -> KeyTree {
    KeyTree::new(&[0x42; 32])
}

pub fn other_keys() -> KeyTree {
    KeyTree::new(&[0x24; 32])
}

pub fn config() -> HwConfig {
    HwConfig::default()
}

/// Mainnet path of `index` (e.g. `0/1`) under the purpose's account
pub fn address_path(purpose: Purpose, index: &str) -> Bip32Path {
    Bip32Path::account(purpose, false).append(&index.parse().unwrap())
}

/// Unsigned request plus the wallet that owns its inputs
pub struct SignFixture {
    pub req: TxSignRequest,
    pub wallet: InMemoryWallet,
    pub indices: Vec<String>,
}

impl SignFixture {
    /// Request with the address indices already looked up
    pub fn resolved(&self) -> TxSignRequest {
        let mut req = self.req.clone();
        req.input_indices = self.indices.clone();
        req
    }
}

fn funding_tx(tag: u8, script_pubkey: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: Version(1),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([tag.wrapping_add(0x20); 32]), 0),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::from_bytes(vec![0x6a]) },
            TxOut { value: Amount::from_sat(value), script_pubkey },
        ],
    }
}

/// One input per purpose at `0/i`, one recipient and native segwit change at `1/0`
pub fn sign_fixture(keys: &KeyTree, purposes: &[Purpose]) -> SignFixture {
    let mut wallet = InMemoryWallet::new(WALLET_ID);
    let mut inputs = Vec::new();
    let mut indices = Vec::new();
    let mut supporting_txs = HashMap::new();

    for (i, purpose) in purposes.iter().enumerate() {
        let index = format!("0/{}", i);
        let pubkey = keys.pubkey(&address_path(*purpose, &index).path);
        let script_pubkey = script_for(*purpose, &pubkey);
        let value = 40_000 + 10_000 * i as u64;
        wallet.add_address(script_pubkey.clone(), index.clone());
        indices.push(index);

        let utxo = if *purpose == Purpose::NonSegWit {
            let prev = funding_tx(i as u8, script_pubkey.clone(), value);
            let txid = prev.txid();
            supporting_txs.insert(txid, serialize(&prev));
            Utxo { txid, vout: 1, value, script_pubkey }
        } else {
            Utxo {
                txid: Txid::from_byte_array([i as u8 + 0x10; 32]),
                vout: i as u32,
                value,
                script_pubkey,
            }
        };
        inputs.push(utxo);
    }

    let change_pubkey = keys.pubkey(&address_path(Purpose::Native, "1/0").path);
    let recipient_pubkey = KeyTree::new(&[0x55; 32]).pubkey(&[0]);
    let req = TxSignRequest {
        inputs,
        recipients: vec![Recipient {
            address: "bc1qrecipient".into(),
            script_pubkey: script_for(Purpose::Native, &recipient_pubkey),
            value: 30_000,
        }],
        change: Some(ChangeOutput {
            address: "bc1qchange".into(),
            script_pubkey: script_for(Purpose::Native, &change_pubkey),
            value: 5_000,
            index: "1/0".into(),
        }),
        rbf: false,
        wallet_ids: vec![WALLET_ID.into()],
        supporting_txs,
        input_indices: Vec::new(),
    };
    SignFixture { req, wallet, indices }
}

fn sighash(tx: &Transaction, index: usize, script: &Script, value: Option<u64>) -> [u8; 32] {
    let mut cache = SighashCache::new(tx);
    match value {
        Some(value) => {
            #[allow(deprecated)]
            let hash = cache
                .segwit_signature_hash(index, script, Amount::from_sat(value), EcdsaSighashType::All)
                .unwrap();
            hash.to_byte_array()
        }
        None => cache
            .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
            .unwrap()
            .to_byte_array(),
    }
}

fn sign_digest(keys: &KeyTree, path: &[u32], digest: [u8; 32]) -> Vec<u8> {
    let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(digest), &keys.secret(path));
    let mut der = sig.serialize_der().to_vec();
    der.push(EcdsaSighashType::All as u8);
    der
}

/// Sign every input of a resolved request the way a device holding `keys` would
pub fn sign_inputs(keys: &KeyTree, req: &TxSignRequest) -> Vec<InputSignature> {
    let tx = req.unsigned_transaction();
    req.signing_inputs(false)
        .unwrap()
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let pubkey = keys.pubkey(&input.path.path);
            let digest = if input.purpose.is_segwit() {
                let script_code = hww_core::core::tx_request::p2pkh_script(&pubkey);
                sighash(&tx, i, &script_code, Some(input.utxo.value))
            } else {
                sighash(&tx, i, &input.utxo.script_pubkey, None)
            };
            InputSignature { signature: sign_digest(keys, &input.path.path, digest), pubkey }
        })
        .collect()
}

pub fn signed_transaction(keys: &KeyTree, req: &TxSignRequest) -> Transaction {
    finalize_transaction(req, &sign_inputs(keys, req)).unwrap()
}

/// Everything queued on the callback channel so far
pub fn drain(events: &mut UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub fn nano_s(serial: &str) -> HidDeviceInfo {
    HidDeviceInfo {
        path: format!("hid-{}", serial),
        vendor_id: 0x2C97,
        product_id: 0x1011,
        interface_number: 0,
        usage_page: 0xFFA0,
        serial: Some(serial.to_string()),
        product: Some("Nano S".into()),
    }
}

#[derive(Default)]
struct LedgerState {
    sent: Vec<ApduCommand>,
    opened: usize,
    signatures: HashMap<Vec<u32>, Vec<u8>>,
    decline: bool,
}

/// HID enumerator whose devices answer from a software key tree
#[derive(Clone)]
pub struct FakeLedger {
    keys: Arc<KeyTree>,
    devices: Vec<HidDeviceInfo>,
    state: Arc<Mutex<LedgerState>>,
}

impl FakeLedger {
    pub fn new(keys: KeyTree, devices: Vec<HidDeviceInfo>) -> Self {
        Self { keys: Arc::new(keys), devices, state: Arc::default() }
    }

    /// Signatures `HASH_SIGN` returns, computed from the request being signed
    pub fn expect_signing(&self, req: &TxSignRequest) {
        let inputs = req.signing_inputs(false).unwrap();
        let mut state = self.state.lock();
        for (input, sig) in inputs.iter().zip(sign_inputs(&self.keys, req)) {
            // the app drops the sighash byte and sets the parity bit in the header
            let mut raw = sig.signature;
            raw.pop();
            raw[0] |= 0x01;
            state.signatures.insert(input.path.path.clone(), raw);
        }
    }

    pub fn decline_signing(&self) {
        self.state.lock().decline = true;
    }

    pub fn sent(&self) -> Vec<ApduCommand> {
        self.state.lock().sent.clone()
    }

    pub fn count(&self, ins: u8) -> usize {
        self.state.lock().sent.iter().filter(|c| c.ins == ins).count()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }
}

impl HidEnumerator for FakeLedger {
    fn enumerate(&self) -> HwResult<Vec<HidDeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn open(&self, info: &HidDeviceInfo, _read_timeout: Duration) -> HwResult<Box<dyn LedgerTransport>> {
        if !self.devices.contains(info) {
            return Err(HwError::DeviceNotFound(info.path.clone()));
        }
        self.state.lock().opened += 1;
        Ok(Box::new(FakeLedgerTransport { keys: Arc::clone(&self.keys), state: Arc::clone(&self.state) }))
    }
}

struct FakeLedgerTransport {
    keys: Arc<KeyTree>,
    state: Arc<Mutex<LedgerState>>,
}

fn parse_path(data: &[u8]) -> Vec<u32> {
    let count = data[0] as usize;
    data[1..1 + count * 4]
        .chunks(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn wallet_public_key(keys: &KeyTree, path: &[u32]) -> Vec<u8> {
    let secp = Secp256k1::new();
    let xpriv = keys.xpriv(path);
    let uncompressed = PublicKey::from_secret_key(&secp, &xpriv.private_key).serialize_uncompressed();
    let mut out = vec![65];
    out.extend_from_slice(&uncompressed);
    out.push(3);
    out.extend_from_slice(b"bc1");
    out.extend_from_slice(&Xpub::from_priv(&secp, &xpriv).encode()[13..45]);
    out
}

impl LedgerTransport for FakeLedgerTransport {
    fn exchange(&mut self, command: &ApduCommand) -> HwResult<ApduResponse> {
        let mut state = self.state.lock();
        state.sent.push(command.clone());
        let data = match command.ins {
            0xC4 => vec![0x00, 0x00, 2, 1, 0],
            0x40 => wallet_public_key(&self.keys, &parse_path(&command.data)),
            0x42 => vec![0x32; 56],
            0x48 => {
                if state.decline {
                    return Ok(ApduResponse { data: Vec::new(), sw: SW_CANCELED_BY_USER });
                }
                match state.signatures.get(&parse_path(&command.data)) {
                    Some(sig) => sig.clone(),
                    None => return Ok(ApduResponse { data: Vec::new(), sw: 0x6A80 }),
                }
            }
            _ => Vec::new(),
        };
        Ok(ApduResponse { data, sw: SW_OK })
    }
}

// ---------------------------------------------------------------------------
// Trezor
// ---------------------------------------------------------------------------

pub fn trezor_features(device_id: &str, model: &str, version: (u32, u32, u32)) -> Features {
    Features {
        vendor: Some("trezor.io".into()),
        major_version: Some(version.0),
        minor_version: Some(version.1),
        patch_version: Some(version.2),
        device_id: Some(device_id.into()),
        label: Some(format!("Trezor {}", device_id)),
        initialized: Some(true),
        model: Some(model.into()),
        ..Default::default()
    }
}

fn failure(code: FailureType, message: &str) -> TrezorMessage {
    TrezorMessage::new(&Failure { code: Some(code as i32), message: Some(message.into()) })
}

fn tx_request(kind: RequestType, index: usize, hash: Option<Vec<u8>>) -> TrezorMessage {
    TrezorMessage::new(&TxRequest {
        request_type: Some(kind as i32),
        details: Some(TxRequestDetails { request_index: Some(index as u32), tx_hash: hash }),
        serialized: None,
    })
}

#[derive(Default)]
struct BridgeState {
    devices: Vec<(String, Features)>,
    sessions: HashMap<String, String>,
    next_session: u32,
    /// Acquire hands back the previous session id instead of a new one
    stale_acquire: bool,
    pin: Option<String>,
    unlocked: bool,
    deferred: Option<TrezorMessage>,
    plan: VecDeque<TrezorMessage>,
    acks: Vec<TxAck>,
    paths: Vec<String>,
    initializes: usize,
    cancels: usize,
}

/// Bridge worker backed by in-memory devices sharing one key tree
#[derive(Clone)]
pub struct FakeBridge {
    keys: Arc<KeyTree>,
    state: Arc<Mutex<BridgeState>>,
}

impl FakeBridge {
    pub fn new(keys: KeyTree) -> Self {
        Self { keys: Arc::new(keys), state: Arc::default() }
    }

    pub fn with_device(self, path: &str, features: Features) -> Self {
        self.state.lock().devices.push((path.to_string(), features));
        self
    }

    pub fn stale_acquire(&self) {
        self.state.lock().stale_acquire = true;
    }

    /// Answer the next public key request with a PIN matrix prompt
    pub fn require_pin(&self, pin: &str) {
        let mut state = self.state.lock();
        state.pin = Some(pin.to_string());
        state.unlocked = false;
    }

    /// Script the `TxRequest` sequence a device would send for `req`,
    /// finishing with `signed` as the serialized transaction
    pub fn expect_signing(&self, req: &TxSignRequest, signed: &Transaction) {
        let mut plan = VecDeque::new();
        for (i, utxo) in req.inputs.iter().enumerate() {
            plan.push_back(tx_request(RequestType::TxInput, i, None));
            if utxo.purpose() == Some(Purpose::NonSegWit) {
                let hash = display_hash(&utxo.txid);
                let prev = req.supporting_tx(&utxo.txid).unwrap();
                plan.push_back(tx_request(RequestType::TxMeta, 0, Some(hash.clone())));
                for j in 0..prev.input.len() {
                    plan.push_back(tx_request(RequestType::TxInput, j, Some(hash.clone())));
                }
                for k in 0..prev.output.len() {
                    plan.push_back(tx_request(RequestType::TxOutput, k, Some(hash.clone())));
                }
            }
        }
        for k in 0..req.outputs().len() {
            plan.push_back(tx_request(RequestType::TxOutput, k, None));
        }
        plan.push_back(TrezorMessage::new(&ButtonRequest { code: Some(8), pages: None }));
        plan.push_back(TrezorMessage::new(&TxRequest {
            request_type: Some(RequestType::TxFinished as i32),
            details: None,
            serialized: Some(TxRequestSerialized {
                signature_index: None,
                signature: None,
                serialized_tx: Some(serialize(signed)),
            }),
        }));
        self.state.lock().plan = plan;
    }

    pub fn acks(&self) -> Vec<TxAck> {
        self.state.lock().acks.clone()
    }

    /// `TxAck`s that carried transaction metadata
    pub fn meta_acks(&self) -> usize {
        self.acks()
            .iter()
            .filter(|ack| ack.tx.as_ref().map_or(false, |tx| tx.inputs_cnt.is_some()))
            .count()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().paths.clone()
    }

    pub fn initializes(&self) -> usize {
        self.state.lock().initializes
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn next_step(state: &mut BridgeState) -> TrezorMessage {
        state
            .plan
            .pop_front()
            .unwrap_or_else(|| failure(FailureType::UnexpectedMessage, "nothing to sign"))
    }

    fn call(&self, state: &mut BridgeState, session: &str, message: TrezorMessage) -> HwResult<TrezorMessage> {
        let path = state
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| HwError::Network(format!("bridge returned 400: unknown session {}", session)))?;

        let reply = match message.kind() {
            Some(MessageType::Initialize) => {
                state.initializes += 1;
                let features = state
                    .devices
                    .iter()
                    .find(|(p, _)| *p == path)
                    .map(|(_, f)| f.clone())
                    .unwrap_or_default();
                TrezorMessage::new(&features)
            }
            Some(MessageType::GetPublicKey) => {
                let request: GetPublicKey = message.decode()?;
                let reply = TrezorMessage::new(&TrezorPublicKey {
                    node: None,
                    xpub: self.keys.xpub(&request.address_n).to_string(),
                });
                if state.pin.is_some() && !state.unlocked {
                    state.deferred = Some(reply);
                    TrezorMessage::new(&PinMatrixRequest { r#type: Some(1) })
                } else {
                    reply
                }
            }
            Some(MessageType::PinMatrixAck) => {
                let ack: PinMatrixAck = message.decode()?;
                if state.pin.as_deref() == Some(ack.pin.as_str()) {
                    state.unlocked = true;
                    state
                        .deferred
                        .take()
                        .unwrap_or_else(|| failure(FailureType::UnexpectedMessage, "no pending request"))
                } else {
                    state.deferred = None;
                    failure(FailureType::PinInvalid, "PIN invalid")
                }
            }
            Some(MessageType::SignTx) | Some(MessageType::ButtonAck) => Self::next_step(state),
            Some(MessageType::TxAck) => {
                state.acks.push(message.decode()?);
                Self::next_step(state)
            }
            Some(MessageType::EndSession) => TrezorMessage::new(&Success { message: None }),
            Some(MessageType::Cancel) => {
                state.cancels += 1;
                state.deferred = None;
                failure(FailureType::ActionCancelled, "Cancelled")
            }
            _ => failure(FailureType::UnexpectedMessage, "unexpected message"),
        };
        Ok(reply)
    }
}

#[async_trait]
impl Worker<BridgeRequest, HwResult<String>> for FakeBridge {
    async fn process(&self, request: BridgeRequest) -> HwResult<String> {
        let mut state = self.state.lock();
        state.paths.push(request.path.clone());
        let parts: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            [""] => Ok(r#"{"version":"2.0.33"}"#.to_string()),
            ["enumerate"] => {
                let entries: Vec<serde_json::Value> = state
                    .devices
                    .iter()
                    .map(|(path, _)| serde_json::json!({ "path": path, "session": null }))
                    .collect();
                Ok(serde_json::Value::Array(entries).to_string())
            }
            ["acquire", path, previous] => {
                let session = if state.stale_acquire {
                    previous.to_string()
                } else {
                    state.next_session += 1;
                    state.next_session.to_string()
                };
                state.sessions.insert(session.clone(), path.to_string());
                Ok(serde_json::json!({ "session": session }).to_string())
            }
            ["release", session] => {
                state.sessions.remove(*session);
                Ok("{}".to_string())
            }
            ["call", session] => {
                let message = TrezorMessage::unpack(request.body.as_deref().unwrap_or_default())?;
                let session = session.to_string();
                Ok(self.call(&mut state, &session, message)?.pack())
            }
            _ => Err(HwError::Network(format!("bridge returned 404 for {}", request.path))),
        }
    }
}

// ---------------------------------------------------------------------------
// Jade
// ---------------------------------------------------------------------------

pub fn jade_port(name: &str) -> JadePort {
    JadePort { port: name.to_string(), vid: 0x10c4, pid: 0xea60, serial_number: None }
}

#[derive(Default)]
struct JadeState {
    /// Reported as `JADE_STATE`
    device_state: String,
    methods: Vec<String>,
    opened: usize,
    /// Presence of each `sign_tx` change entry
    change: Vec<bool>,
}

/// Serial scanner whose ports are served by an in-process Jade simulator
#[derive(Clone)]
pub struct FakeJade {
    keys: Arc<KeyTree>,
    ports: Vec<JadePort>,
    silent: Arc<HashSet<String>>,
    state: Arc<Mutex<JadeState>>,
}

impl FakeJade {
    pub fn new(keys: KeyTree, ports: Vec<JadePort>) -> Self {
        let jade = Self { keys: Arc::new(keys), ports, silent: Arc::default(), state: Arc::default() };
        jade.set_state("READY");
        jade
    }

    pub fn with_state(self, state: &str) -> Self {
        self.set_state(state);
        self
    }

    /// Change `JADE_STATE`, e.g. after the user unlocks the device
    pub fn set_state(&self, state: &str) {
        self.state.lock().device_state = state.to_string();
    }

    /// Methods the simulator reads but never answers
    pub fn silent_on(mut self, methods: &[&str]) -> Self {
        self.silent = Arc::new(methods.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn methods(&self) -> Vec<String> {
        self.state.lock().methods.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state.lock().methods.iter().filter(|m| *m == method).count()
    }

    pub fn change_entries(&self) -> Vec<bool> {
        self.state.lock().change.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }
}

#[async_trait]
impl JadePortScanner for FakeJade {
    fn list_ports(&self) -> HwResult<Vec<JadePort>> {
        Ok(self.ports.clone())
    }

    async fn open(&self, port: &JadePort) -> HwResult<Box<dyn JadeStream>> {
        let (host, device) = tokio::io::duplex(4096);
        self.state.lock().opened += 1;
        let efusemac = format!("JADE{}", port.port.trim_start_matches("/dev/tty").to_uppercase());
        tokio::spawn(JadeSim::new(self.clone(), efusemac).run(device));
        Ok(Box::new(host))
    }
}

fn field<'a>(map: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(text) if text == name))
        .map(|(_, v)| v)
}

fn text_field(map: &[(Value, Value)], name: &str) -> String {
    match field(map, name) {
        Some(Value::Text(text)) => text.clone(),
        other => panic!("expected text {}, got {:?}", name, other),
    }
}

fn bytes_field(map: &[(Value, Value)], name: &str) -> Vec<u8> {
    match field(map, name) {
        Some(Value::Bytes(bytes)) => bytes.clone(),
        other => panic!("expected bytes {}, got {:?}", name, other),
    }
}

fn path_field(map: &[(Value, Value)], name: &str) -> Vec<u32> {
    match field(map, name) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Integer(i) => u32::try_from(*i).unwrap(),
                other => panic!("expected path index, got {:?}", other),
            })
            .collect(),
        other => panic!("expected path {}, got {:?}", name, other),
    }
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (Value::Text(k.to_string()), v)).collect())
}

struct JadeSim {
    jade: FakeJade,
    efusemac: String,
    signing: Option<Transaction>,
    next_input: usize,
}

impl JadeSim {
    fn new(jade: FakeJade, efusemac: String) -> Self {
        Self { jade, efusemac, signing: None, next_input: 0 }
    }

    async fn run(mut self, mut stream: DuplexStream) {
        let mut decoder = CborStreamDecoder::new();
        let mut buf = [0u8; 512];
        loop {
            let read = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            decoder.push(&buf[..read]);
            while let Ok(Some(request)) = decoder.next_value() {
                let mut out = Vec::new();
                for reply in self.answer(request) {
                    ciborium::ser::into_writer(&reply, &mut out).unwrap();
                }
                if !out.is_empty() && stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    fn answer(&mut self, request: Value) -> Vec<Value> {
        let Value::Map(request) = request else { panic!("request is not a map") };
        let id = text_field(&request, "id");
        let method = text_field(&request, "method");
        self.jade.state.lock().methods.push(method.clone());
        if self.jade.silent.contains(&method) {
            return Vec::new();
        }
        let params = match field(&request, "params") {
            Some(Value::Map(params)) => params.clone(),
            _ => Vec::new(),
        };

        let reply = |result: Value| map(vec![("id", Value::Text(id.clone())), ("result", result)]);
        match method.as_str() {
            "get_version_info" => vec![
                map(vec![("log", Value::Text("jade: version requested\n".into()))]),
                reply(map(vec![
                    ("JADE_VERSION", Value::Text("1.0.27".into())),
                    ("JADE_STATE", Value::Text(self.jade.state.lock().device_state.clone())),
                    ("EFUSEMAC", Value::Text(self.efusemac.clone())),
                    ("JADE_NETWORKS", Value::Text("ALL".into())),
                    ("BOARD_TYPE", Value::Text("JADE_V1.1".into())),
                ])),
            ],
            "auth_user" => vec![reply(Value::Bool(true))],
            "get_xpub" => {
                let path = path_field(&params, "path");
                vec![reply(Value::Text(self.jade.keys.xpub(&path).to_string()))]
            }
            "sign_tx" => {
                let txn = bytes_field(&params, "txn");
                self.signing = Some(deserialize(&txn).unwrap());
                self.next_input = 0;
                let change = match field(&params, "change") {
                    Some(Value::Array(entries)) => entries.iter().map(|e| !e.is_null()).collect(),
                    _ => Vec::new(),
                };
                self.jade.state.lock().change = change;
                vec![reply(Value::Bool(true))]
            }
            "tx_input" => {
                let tx = self.signing.clone().expect("tx_input before sign_tx");
                let index = self.next_input;
                self.next_input += 1;
                let path = path_field(&params, "path");
                let script = bytes_field(&params, "script");
                let satoshi = match field(&params, "satoshi") {
                    Some(Value::Integer(value)) => Some(u64::try_from(*value).unwrap()),
                    _ => None,
                };
                let digest = sighash(&tx, index, Script::from_bytes(&script), satoshi);
                vec![reply(Value::Bytes(sign_digest(&self.jade.keys, &path, digest)))]
            }
            other => vec![map(vec![
                ("id", Value::Text(id.clone())),
                (
                    "error",
                    map(vec![
                        ("code", Value::Integer((-32601).into())),
                        ("message", Value::Text(format!("unknown method {}", other))),
                    ]),
                ),
            ])],
        }
    }
}
