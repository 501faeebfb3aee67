// src/main.rs
//! Hardware wallet device tool
//! Scans attached Trezor, Ledger and Jade devices and exports their public keys.
use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use hww_core::core::config::HwConfig;
use hww_core::core::types::DeviceKey;
use hww_core::core::wallet::{compute_wallet_id, InMemoryWallets};
use hww_core::hardware::trezor::TrezorClient;
use hww_core::hardware::{ChannelCallbacks, DeviceEvent, DeviceManager, NullCallbacks};
use secrecy::SecretString;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "hww")]
#[command(about = "Hardware wallet device layer: Trezor, Ledger and Jade")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use testnet derivation paths and xpub versions
    #[arg(long, global = true)]
    testnet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices
    Scan,
    /// Export root, legacy, nested and native segwit xpubs
    Pubkeys(DeviceArgs),
    /// Print the m/0' xpub and the wallet id derived from it
    XpubRoot(DeviceArgs),
    /// Print the Trezor bridge version
    BridgeVersion,
}

#[derive(ClapArgs)]
struct DeviceArgs {
    /// Device selector `<type>:<id>`, e.g. `trezor:3F1A...`
    #[arg(long)]
    device: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    let mut config = match &args.config {
        Some(path) => HwConfig::load(path).with_context(|| format!("load {}", path.display()))?,
        None => HwConfig::default(),
    };
    config.apply_env_overrides()?;
    if args.testnet {
        config.testnet = true;
    }
    info!("hww v{} ({})", env!("CARGO_PKG_VERSION"), if config.testnet { "testnet" } else { "mainnet" });

    if let Commands::BridgeVersion = args.command {
        let client = TrezorClient::new(&config, Arc::new(NullCallbacks));
        let version = client.init_connection().await?;
        println!("{}", version);
        return Ok(());
    }

    let (callbacks, events) = ChannelCallbacks::new();
    let manager = Arc::new(DeviceManager::new(
        &config,
        Arc::new(InMemoryWallets::default()),
        Arc::new(callbacks),
    ));
    tokio::spawn(answer_prompts(Arc::downgrade(&manager), events));

    let keys = manager.scan_devices().await?;
    match args.command {
        Commands::Scan => {
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Commands::Pubkeys(device) => {
            let key = select(&keys, &device.device)?;
            let info = manager.get_public_keys(&key).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::XpubRoot(device) => {
            let key = select(&keys, &device.device)?;
            let xpub = manager.retrieve_xpub_root(&key).await?;
            println!("{}", xpub);
            println!("wallet id: {}", compute_wallet_id(&xpub)?);
        }
        Commands::BridgeVersion => {}
    }

    manager.release_devices().await;
    Ok(())
}

fn select(keys: &[DeviceKey], selector: &str) -> Result<DeviceKey> {
    let (device_type, id) = DeviceKey::parse_selector(selector)?;
    keys.iter()
        .find(|key| key.device_type == device_type && key.id == id)
        .cloned()
        .ok_or_else(|| anyhow!("device {} is not attached", selector))
}

fn read_line(prompt: &str) -> Result<String> {
    eprint!("{}", prompt);
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Log device events and answer PIN and passphrase prompts from stdin
async fn answer_prompts(manager: Weak<DeviceManager>, mut events: UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::RequestPinMatrix(key) => {
                let answer = tokio::task::spawn_blocking(|| {
                    read_line("PIN (positions on the device matrix, 7 8 9 / 4 5 6 / 1 2 3): ")
                })
                .await;
                let Some(manager) = manager.upgrade() else { break };
                match answer {
                    Ok(Ok(pin)) => {
                        if let Err(e) = manager.set_matrix_pin(&key, SecretString::new(pin)) {
                            warn!("PIN not delivered: {}", e);
                        }
                    }
                    _ => manager.cancel(&key),
                }
            }
            DeviceEvent::RequestHwPass { key, allowed_on_device } => {
                let prompt = if allowed_on_device {
                    "Passphrase (empty line to enter it on the device): "
                } else {
                    "Passphrase: "
                };
                let answer = tokio::task::spawn_blocking(move || read_line(prompt)).await;
                let Some(manager) = manager.upgrade() else { break };
                match answer {
                    Ok(Ok(passphrase)) => {
                        let on_device = allowed_on_device && passphrase.is_empty();
                        if let Err(e) = manager.set_passphrase(&key, SecretString::new(passphrase), on_device) {
                            warn!("passphrase not delivered: {}", e);
                        }
                    }
                    _ => manager.cancel(&key),
                }
            }
            DeviceEvent::DeviceTxStatusChanged { key, status } => info!(device = %key, "{}", status),
            DeviceEvent::OperationFailed { key, reason } => warn!(device = %key, "operation failed: {}", reason),
            DeviceEvent::RequestForRescan(key) => warn!(device = %key, "device lost, scan again"),
            other => info!("{:?}", other),
        }
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
