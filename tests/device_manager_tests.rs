//! tests/device_manager_tests.rs
//!
//! Device manager over all three families at once: merged scans, routing by
//! device key and binding a wallet to an attached device.

mod util;

use hww_core::core::bip32::Purpose;
use hww_core::core::config::HwConfig;
use hww_core::core::errors::HwError;
use hww_core::core::types::{DeviceKey, DeviceType};
use hww_core::core::wallet::{HwWalletBinding, InMemoryWallet, InMemoryWallets};
use hww_core::hardware::jade::JadeClient;
use hww_core::hardware::ledger::LedgerClient;
use hww_core::hardware::trezor::TrezorClient;
use hww_core::hardware::{ChannelCallbacks, DeviceClient, DeviceEvent, DeviceManager};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use util::*;

struct Harness {
    bridge: FakeBridge,
    ledger: FakeLedger,
    jade: FakeJade,
    wallets: Arc<InMemoryWallets>,
    manager: Arc<DeviceManager>,
    events: UnboundedReceiver<DeviceEvent>,
}

fn harness() -> Harness {
    harness_with(
        FakeBridge::new(device_keys()).with_device("1", trezor_features("DEV-T", "T", (2, 6, 3))),
        FakeLedger::new(device_keys(), vec![nano_s("0001")]),
        FakeJade::new(device_keys(), vec![jade_port("/dev/ttyUSB0")]),
        config(),
    )
}

fn harness_with(bridge: FakeBridge, ledger: FakeLedger, jade: FakeJade, config: HwConfig) -> Harness {
    let (callbacks, events) = ChannelCallbacks::new();
    let callbacks = Arc::new(callbacks);
    let clients: Vec<Arc<dyn DeviceClient>> = vec![
        Arc::new(TrezorClient::with_worker(&config, Arc::new(bridge.clone()), callbacks.clone())),
        Arc::new(LedgerClient::with_enumerator(&config, Arc::new(ledger.clone()), callbacks.clone())),
        Arc::new(JadeClient::with_scanner(&config, Arc::new(jade.clone()), callbacks.clone())),
    ];
    let wallets = Arc::new(InMemoryWallets::default());
    let manager = Arc::new(DeviceManager::with_clients(&config, clients, wallets.clone(), callbacks));
    Harness { bridge, ledger, jade, wallets, manager, events }
}

fn bound_wallet(id: &str, device_type: DeviceType, device_id: &str) -> Arc<InMemoryWallet> {
    Arc::new(InMemoryWallet::new(id).with_binding(HwWalletBinding {
        device_type,
        vendor: "any".into(),
        device_id: device_id.into(),
    }))
}

#[test_log::test(tokio::test)]
async fn test_scan_merges_families_into_one_event() {
    let mut h = harness();
    let keys = h.manager.scan_devices().await.unwrap();

    let mut ids: Vec<(DeviceType, String)> = keys.iter().map(|k| (k.device_type, k.id.clone())).collect();
    ids.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        ids,
        vec![
            (DeviceType::Ledger, "0001".to_string()),
            (DeviceType::Trezor, "DEV-T".to_string()),
            (DeviceType::Jade, "JADEUSB0".to_string()),
        ]
    );
    assert_eq!(h.manager.devices(), keys);
    assert!(!h.manager.is_scanning());

    let events = drain(&mut h.events);
    let changes: Vec<&Vec<DeviceKey>> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::DevicesChanged(keys) => Some(keys),
            _ => None,
        })
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].len(), 3);

    // rescanning replaces rather than accumulates
    assert_eq!(h.manager.scan_devices().await.unwrap().len(), 3);
    assert_eq!(h.ledger.opened(), 0);
    assert_eq!(h.jade.opened(), 2);
}

#[tokio::test]
async fn test_routing_errors() {
    let h = harness();
    h.manager.scan_devices().await.unwrap();

    assert!(matches!(
        h.manager.get_device(DeviceType::None),
        Err(HwError::UnsupportedDeviceType(_))
    ));
    assert_eq!(h.manager.get_device(DeviceType::Jade).unwrap().device_type(), DeviceType::Jade);

    let ghost = DeviceKey::new(DeviceType::Trezor, "ghost", "Trezor", "trezor.io");
    assert!(matches!(h.manager.get_public_keys(&ghost).await, Err(HwError::DeviceNotFound(_))));
    assert!(matches!(
        h.manager.set_matrix_pin(&ghost, secrecy::SecretString::new("1".into())),
        Err(HwError::DeviceNotFound(_))
    ));
    // idle or unknown devices ignore cancel
    h.manager.cancel(&ghost);

    let trezor = h.manager.devices().into_iter().find(|k| k.device_type == DeviceType::Trezor).unwrap();
    assert!(matches!(
        h.manager.set_matrix_pin(&trezor, secrecy::SecretString::new("1".into())),
        Err(HwError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_prepare_device_by_binding() {
    let mut h = harness();
    h.wallets.insert(bound_wallet("jade-wallet", DeviceType::Jade, "JADEUSB0"));
    h.wallets.insert(bound_wallet("lost-trezor", DeviceType::Trezor, "OTHER"));
    h.wallets.insert(Arc::new(InMemoryWallet::new("software")));

    let key = h.manager.prepare_device_for_sign("jade-wallet").await.unwrap().unwrap();
    assert_eq!(key.device_type, DeviceType::Jade);
    assert_eq!(key.wallet_id, "jade-wallet");
    let events = drain(&mut h.events);
    assert_eq!(events.last(), Some(&DeviceEvent::DeviceReady("jade-wallet".into())));
    assert!(h.manager.devices().iter().any(|k| k.wallet_id == "jade-wallet"));

    assert_eq!(h.manager.prepare_device_for_sign("lost-trezor").await.unwrap(), None);
    let events = drain(&mut h.events);
    assert_eq!(events.last(), Some(&DeviceEvent::DeviceNotFound("lost-trezor".into())));

    assert_eq!(h.manager.prepare_device_for_sign("software").await.unwrap(), None);
    let events = drain(&mut h.events);
    assert_eq!(events, vec![DeviceEvent::DeviceNotFound("software".into())]);

    assert!(matches!(
        h.manager.prepare_device_for_sign("nope").await,
        Err(HwError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_sign_without_address_index() {
    let mut h = harness();
    let fixture = sign_fixture(&device_keys(), &[Purpose::Native]);
    // wallet knows none of the inputs
    h.wallets.insert(Arc::new(InMemoryWallet::new(WALLET_ID)));
    let keys = h.manager.scan_devices().await.unwrap();
    let trezor = keys.iter().find(|k| k.device_type == DeviceType::Trezor).unwrap();
    drain(&mut h.events);

    let err = h.manager.sign_tx(trezor, fixture.req.clone()).await.unwrap_err();
    assert!(matches!(err, HwError::MissingAddressIndex(_)), "{:?}", err);
    assert!(h.bridge.acks().is_empty());

    let events = drain(&mut h.events);
    assert!(matches!(
        events.as_slice(),
        [DeviceEvent::OperationFailed { key, reason }] if key.id == "DEV-T" && reason.contains("address index")
    ));
}

#[tokio::test]
async fn test_sign_routes_to_requested_family() {
    let mut h = harness();
    let fixture = sign_fixture(&device_keys(), &[Purpose::Native]);
    h.wallets.insert(Arc::new(fixture.wallet.clone()));
    h.ledger.expect_signing(&fixture.resolved());
    let keys = h.manager.scan_devices().await.unwrap();
    drain(&mut h.events);

    let ledger = keys.iter().find(|k| k.device_type == DeviceType::Ledger).unwrap();
    let signed = h.manager.sign_tx(ledger, fixture.req.clone()).await.unwrap();
    assert_eq!(
        bitcoin::consensus::encode::serialize(&signed_transaction(&device_keys(), &fixture.resolved())),
        signed
    );
    assert!(h.bridge.acks().is_empty());
    assert_eq!(h.jade.count("sign_tx"), 0);
}

#[tokio::test]
async fn test_release_devices() {
    let h = harness();
    h.manager.scan_devices().await.unwrap();
    assert_eq!(h.bridge.open_sessions(), 1);

    h.manager.release_devices().await;
    assert!(h.manager.devices().is_empty());
    assert_eq!(h.bridge.open_sessions(), 0);
    for device_type in [DeviceType::Trezor, DeviceType::Ledger, DeviceType::Jade] {
        assert!(h.manager.get_device(device_type).unwrap().device_keys().is_empty());
    }
}

#[tokio::test]
async fn test_empty_scan_in_every_family() {
    let mut h = harness_with(
        FakeBridge::new(device_keys()),
        FakeLedger::new(device_keys(), Vec::new()),
        FakeJade::new(device_keys(), Vec::new()),
        config(),
    );

    assert!(h.manager.scan_devices().await.unwrap().is_empty());
    assert!(h.manager.devices().is_empty());
    assert_eq!(drain(&mut h.events), vec![DeviceEvent::DevicesChanged(Vec::new())]);
    assert_eq!(h.ledger.opened(), 0);
    assert_eq!(h.jade.opened(), 0);
    for device_type in [DeviceType::Trezor, DeviceType::Ledger, DeviceType::Jade] {
        assert!(h.manager.get_device(device_type).unwrap().device_keys().is_empty());
    }
}

#[tokio::test]
async fn test_prepare_jade_leaves_other_families_alone() {
    let mut h = harness();
    h.manager.scan_devices().await.unwrap();
    h.wallets.insert(bound_wallet("jade-wallet", DeviceType::Jade, "JADEUSB0"));
    drain(&mut h.events);
    let bridge_calls = h.bridge.paths().len();
    let jade_opened = h.jade.opened();

    let key = h.manager.prepare_device_for_sign("jade-wallet").await.unwrap().unwrap();
    assert_eq!(key.id, "JADEUSB0");
    assert_eq!(h.bridge.paths().len(), bridge_calls);
    assert_eq!(h.bridge.open_sessions(), 1);
    assert_eq!(h.jade.opened(), jade_opened);
    assert_eq!(h.ledger.opened(), 0);
    assert_eq!(drain(&mut h.events), vec![DeviceEvent::DeviceReady("jade-wallet".into())]);
    assert_eq!(h.manager.devices().len(), 3);
}

#[tokio::test]
async fn test_second_operation_fails_fast() {
    let mut config = config();
    config.jade.request_timeout_ms = 60_000;
    let mut h = harness_with(
        FakeBridge::new(device_keys()),
        FakeLedger::new(device_keys(), Vec::new()),
        FakeJade::new(device_keys(), vec![jade_port("/dev/ttyUSB0")]).silent_on(&["get_xpub"]),
        config,
    );
    let keys = h.manager.scan_devices().await.unwrap();
    let key = keys[0].clone();
    drain(&mut h.events);

    let pending = {
        let manager = Arc::clone(&h.manager);
        let key = key.clone();
        tokio::spawn(async move { manager.get_public_keys(&key).await })
    };
    while h.jade.count("get_xpub") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(h.manager.retrieve_xpub_root(&key).await, Err(HwError::DeviceBusy)));
    assert!(matches!(h.manager.get_public_keys(&key).await, Err(HwError::DeviceBusy)));
    // rejected operations report nothing
    assert!(drain(&mut h.events).is_empty());

    h.manager.cancel(&key);
    assert!(matches!(pending.await.unwrap(), Err(HwError::Cancelled)));
    assert!(!h.manager.handle(&key).unwrap().is_blocked());
}
