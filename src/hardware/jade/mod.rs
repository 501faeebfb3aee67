//! Blockstream Jade over USB serial (CBOR RPC)

pub mod client;
pub mod device;
pub mod messages;
pub mod transport;

pub use client::JadeClient;
pub use device::JadeDevice;
#[cfg(feature = "jade")]
pub use transport::SerialScanner;
pub use transport::{JadePort, JadePortScanner, JadeRpc, JadeStream, NoSerial};
