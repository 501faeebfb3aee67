//! tests/trezor_signing_tests.rs
//!
//! Trezor driver over a scripted bridge worker: PIN matrix prompts, the
//! TxRequest/TxAck signing loop and firmware gating during scan.

mod util;

use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use hww_core::core::bip32::Purpose;
use hww_core::core::errors::HwError;
use hww_core::core::types::{status, DeviceKey};
use hww_core::core::wallet::InMemoryWallets;
use hww_core::hardware::trezor::TrezorClient;
use hww_core::hardware::{ChannelCallbacks, DeviceClient, DeviceEvent, DeviceManager};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use util::*;

struct Harness {
    bridge: FakeBridge,
    wallets: Arc<InMemoryWallets>,
    manager: Arc<DeviceManager>,
    events: UnboundedReceiver<DeviceEvent>,
}

fn harness(bridge: FakeBridge) -> Harness {
    let (callbacks, events) = ChannelCallbacks::new();
    let callbacks = Arc::new(callbacks);
    let config = config();
    let client: Arc<dyn DeviceClient> =
        Arc::new(TrezorClient::with_worker(&config, Arc::new(bridge.clone()), callbacks.clone()));
    let wallets = Arc::new(InMemoryWallets::default());
    let manager = Arc::new(DeviceManager::with_clients(&config, vec![client], wallets.clone(), callbacks));
    Harness { bridge, wallets, manager, events }
}

fn model_t() -> FakeBridge {
    FakeBridge::new(device_keys()).with_device("1", trezor_features("DEV-T", "T", (2, 6, 3)))
}

async fn scanned(h: &mut Harness) -> DeviceKey {
    let keys = h.manager.scan_devices().await.unwrap();
    assert_eq!(keys.len(), 1);
    drain(&mut h.events);
    keys[0].clone()
}

/// Answer the first PIN prompt with `pin`, hand the receiver back afterwards
fn answer_pin(
    manager: Arc<DeviceManager>,
    mut events: UnboundedReceiver<DeviceEvent>,
    pin: &'static str,
) -> tokio::task::JoinHandle<(UnboundedReceiver<DeviceEvent>, Vec<DeviceEvent>)> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let prompt = match &event {
                DeviceEvent::RequestPinMatrix(key) => Some(key.clone()),
                _ => None,
            };
            seen.push(event);
            if let Some(key) = prompt {
                manager.set_matrix_pin(&key, SecretString::new(pin.to_string())).unwrap();
                break;
            }
        }
        (events, seen)
    })
}

#[tokio::test]
async fn test_scan_and_export_public_keys() {
    let mut h = harness(model_t());
    let key = scanned(&mut h).await;
    assert_eq!(key.id, "DEV-T");
    assert_eq!(key.status, status::READY);
    assert_eq!(h.bridge.open_sessions(), 1);

    let info = h.manager.get_public_keys(&key).await.unwrap();
    let keys = device_keys();
    assert_eq!(info.device_id, "DEV-T");
    assert_eq!(info.vendor, "trezor.io");
    assert_eq!(info.xpub_root, keys.root_xpub());
    assert_eq!(info.xpub_legacy, keys.account_xpub(Purpose::NonSegWit));
    assert_eq!(info.xpub_nested_segwit, keys.account_xpub(Purpose::Nested));
    assert_eq!(info.xpub_native_segwit, keys.account_xpub(Purpose::Native));

    let xpub = h.manager.retrieve_xpub_root(&key).await.unwrap();
    assert_eq!(xpub, keys.root_xpub());
}

#[test_log::test(tokio::test)]
async fn test_sign_mixed_inputs_streams_supporting_tx() {
    let mut h = harness(model_t());
    let fixture = sign_fixture(&device_keys(), &[Purpose::NonSegWit, Purpose::Native]);
    h.wallets.insert(Arc::new(fixture.wallet.clone()));
    let expected = signed_transaction(&device_keys(), &fixture.resolved());
    h.bridge.expect_signing(&fixture.resolved(), &expected);
    let key = scanned(&mut h).await;

    let signed = h.manager.sign_tx(&key, fixture.req.clone()).await.unwrap();
    let tx: Transaction = deserialize(&signed).unwrap();
    assert_eq!(tx, expected);

    // one TXMETA for the single legacy input's previous transaction
    assert_eq!(h.bridge.meta_acks(), 1);
    let acks = h.bridge.acks();
    let current_inputs: Vec<_> = acks
        .iter()
        .filter_map(|ack| ack.tx.as_ref())
        .flat_map(|tx| tx.inputs.iter())
        .filter(|input| !input.address_n.is_empty())
        .collect();
    assert_eq!(current_inputs.len(), 2);
    assert!(current_inputs[0].amount.is_none());
    assert_eq!(current_inputs[1].amount, Some(fixture.req.inputs[1].value));

    let events = drain(&mut h.events);
    assert!(events.contains(&DeviceEvent::TxSigned(signed)));
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::DeviceTxStatusChanged { status: s, .. } if s == status::CONFIRM_ON_DEVICE
    )));
}

#[tokio::test]
async fn test_signature_from_other_seed_rejected() {
    let mut h = harness(model_t());
    let fixture = sign_fixture(&device_keys(), &[Purpose::Native, Purpose::Nested]);
    h.wallets.insert(Arc::new(fixture.wallet.clone()));
    // device unlocked with a different passphrase signs with other keys
    let forged = signed_transaction(&other_keys(), &fixture.resolved());
    h.bridge.expect_signing(&fixture.resolved(), &forged);
    let key = scanned(&mut h).await;

    let err = h.manager.sign_tx(&key, fixture.req.clone()).await.unwrap_err();
    assert!(matches!(err, HwError::PassphraseVerification), "{:?}", err);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::OperationFailed { reason, .. } if reason == "signing failed, check your passphrase"
    )));
    assert!(!events.iter().any(|e| matches!(e, DeviceEvent::TxSigned(_))));
}

#[tokio::test]
async fn test_pin_matrix_flow() {
    let mut h = harness(model_t());
    let key = scanned(&mut h).await;
    h.bridge.require_pin("1478");

    let Harness { manager, events, .. } = h;
    let responder = answer_pin(Arc::clone(&manager), events, "1478");
    let info = manager.get_public_keys(&key).await.unwrap();
    assert_eq!(info.xpub_root, device_keys().root_xpub());

    let (_, seen) = responder.await.unwrap();
    assert!(seen.iter().any(|e| matches!(
        e,
        DeviceEvent::DeviceTxStatusChanged { status: s, .. } if s == status::ENTER_PIN
    )));
}

#[tokio::test]
async fn test_wrong_pin_reports_invalid_pin() {
    let mut h = harness(model_t());
    let key = scanned(&mut h).await;
    h.bridge.require_pin("1478");

    let Harness { manager, events, .. } = h;
    let responder = answer_pin(Arc::clone(&manager), events, "9999");
    let err = manager.get_public_keys(&key).await.unwrap_err();
    assert!(matches!(err, HwError::InvalidPin));

    let (mut events, _) = responder.await.unwrap();
    let rest = drain(&mut events);
    assert!(rest.iter().any(|e| matches!(e, DeviceEvent::InvalidPin(k) if k.id == "DEV-T")));
    assert!(!rest.iter().any(|e| matches!(e, DeviceEvent::OperationFailed { .. })));

    // the device is usable again once the session state is reset
    assert!(!manager.handle(&key).unwrap().is_blocked());
}

#[tokio::test]
async fn test_cancel_during_pin_prompt_reaches_device() {
    let mut h = harness(model_t());
    let key = scanned(&mut h).await;
    h.bridge.require_pin("1478");

    let Harness { bridge, manager, mut events, .. } = h;
    let pending = {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        tokio::spawn(async move { manager.get_public_keys(&key).await })
    };
    loop {
        match events.recv().await {
            Some(DeviceEvent::RequestPinMatrix(_)) => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }

    manager.cancel(&key);
    assert!(matches!(pending.await.unwrap(), Err(HwError::Cancelled)));

    // Cancel is queued on the bridge pool, its reply only logged
    for _ in 0..100 {
        if bridge.cancels() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bridge.cancels(), 1);
    assert!(!manager.handle(&key).unwrap().is_blocked());
    let rest = drain(&mut events);
    assert!(!rest.iter().any(|e| matches!(e, DeviceEvent::OperationFailed { .. })));
}

#[tokio::test]
async fn test_failure_resets_session_state() {
    let mut h = harness(model_t());
    let fixture = sign_fixture(&device_keys(), &[Purpose::Native]);
    h.wallets.insert(Arc::new(fixture.wallet.clone()));
    let key = scanned(&mut h).await;
    assert_eq!(h.bridge.initializes(), 1);

    // nothing scripted, the device answers SignTx with a Failure
    let err = h.manager.sign_tx(&key, fixture.req.clone()).await.unwrap_err();
    assert!(matches!(err, HwError::Protocol(_)), "{:?}", err);
    drain(&mut h.events);

    let info = h.manager.get_public_keys(&key).await.unwrap();
    assert_eq!(info.xpub_root, device_keys().root_xpub());
    assert_eq!(h.bridge.initializes(), 2);

    // features are cached again
    h.manager.retrieve_xpub_root(&key).await.unwrap();
    assert_eq!(h.bridge.initializes(), 2);
}

#[tokio::test]
async fn test_old_firmware_is_skipped_and_released() {
    let bridge = FakeBridge::new(device_keys())
        .with_device("1", trezor_features("OLD", "T", (2, 2, 0)))
        .with_device("2", trezor_features("NEW", "1", (1, 11, 2)));
    let mut h = harness(bridge);

    let keys = h.manager.scan_devices().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, "NEW");
    assert!(h.bridge.paths().contains(&"/release/1".to_string()));
    assert_eq!(h.bridge.open_sessions(), 1);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::OperationFailed { reason, .. } if reason.contains("2.2.0")
    )));
    assert_eq!(events.last(), Some(&DeviceEvent::DevicesChanged(keys)));

    h.manager.release_devices().await;
    assert_eq!(h.bridge.open_sessions(), 0);
    assert!(h.manager.devices().is_empty());
}

#[tokio::test]
async fn test_stale_acquire_skips_device() {
    let bridge = model_t();
    bridge.stale_acquire();
    let mut h = harness(bridge);

    assert!(h.manager.scan_devices().await.unwrap().is_empty());
    assert!(!h.bridge.paths().iter().any(|p| p.starts_with("/call/")));
    drain(&mut h.events);
}
