//! Jade serial transport
//!
//! `JadeRpc` runs the CBOR request/response exchange over any async byte
//! stream. Port discovery and opening go through `JadePortScanner`, backed by
//! tokio-serial when the `jade` feature is enabled.

use super::messages::{CborStreamDecoder, JadeRequest, JadeResponse};
use crate::core::errors::{HwError, HwResult};
use async_trait::async_trait;
use ciborium::value::Value;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Writes are split so the device UART buffer never overflows
pub const WRITE_CHUNK: usize = 256;
const READ_BUFFER: usize = 1024;

/// USB bridges Jade ships with: CP210x and CH9102
pub const JADE_USB_IDS: [(u16, u16); 2] = [(0x10c4, 0xea60), (0x1a86, 0x55d4)];

pub trait JadeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> JadeStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Enumerated serial port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JadePort {
    pub port: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
}

impl JadePort {
    pub fn is_jade(&self) -> bool {
        JADE_USB_IDS.contains(&(self.vid, self.pid))
    }
}

#[async_trait]
pub trait JadePortScanner: Send + Sync {
    /// Blocking, run it off the async executor
    fn list_ports(&self) -> HwResult<Vec<JadePort>>;

    async fn open(&self, port: &JadePort) -> HwResult<Box<dyn JadeStream>>;
}

/// Scanner used when serial support is compiled out
pub struct NoSerial;

#[async_trait]
impl JadePortScanner for NoSerial {
    fn list_ports(&self) -> HwResult<Vec<JadePort>> {
        Ok(Vec::new())
    }

    async fn open(&self, port: &JadePort) -> HwResult<Box<dyn JadeStream>> {
        Err(HwError::Transport(format!("serial support is disabled, cannot open {}", port.port)))
    }
}

#[cfg(feature = "jade")]
pub use serial::SerialScanner;

#[cfg(feature = "jade")]
mod serial {
    use super::{JadePort, JadePortScanner, JadeStream};
    use crate::core::errors::HwResult;
    use async_trait::async_trait;
    use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, StopBits};
    use tracing::debug;

    /// USB serial ports via tokio-serial, 8N1 without flow control
    pub struct SerialScanner {
        baud_rate: u32,
    }

    impl SerialScanner {
        pub fn new(baud_rate: u32) -> Self {
            Self { baud_rate }
        }
    }

    #[async_trait]
    impl JadePortScanner for SerialScanner {
        fn list_ports(&self) -> HwResult<Vec<JadePort>> {
            let ports = tokio_serial::available_ports()?
                .into_iter()
                .filter_map(|info| match info.port_type {
                    SerialPortType::UsbPort(usb) => Some(JadePort {
                        port: info.port_name,
                        vid: usb.vid,
                        pid: usb.pid,
                        serial_number: usb.serial_number,
                    }),
                    _ => None,
                })
                .collect::<Vec<_>>();
            debug!("{} USB serial port(s) present", ports.len());
            Ok(ports)
        }

        async fn open(&self, port: &JadePort) -> HwResult<Box<dyn JadeStream>> {
            let stream = tokio_serial::new(&port.port, self.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .open_native_async()?;
            debug!(port = %port.port, baud = self.baud_rate, "serial port opened");
            Ok(Box::new(stream))
        }
    }
}

fn log_text(log: &Value) -> String {
    match log {
        Value::Text(text) => text.trim_end().to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).trim_end().to_string(),
        other => format!("{:?}", other),
    }
}

/// CBOR RPC channel to one Jade
///
/// Every request id stays in `pending` until its reply is consumed. Replies
/// to pending ids that arrive out of order are stashed; replies to ids that
/// are no longer pending (abandoned requests) are dropped.
pub struct JadeRpc {
    stream: Box<dyn JadeStream>,
    decoder: CborStreamDecoder,
    next_id: u64,
    pending: VecDeque<String>,
    stash: HashMap<String, JadeResponse>,
    timeout: Duration,
    writing: bool,
}

impl JadeRpc {
    pub fn new(stream: Box<dyn JadeStream>, timeout: Duration) -> Self {
        Self {
            stream,
            decoder: CborStreamDecoder::new(),
            next_id: 0,
            pending: VecDeque::new(),
            stash: HashMap::new(),
            timeout,
            writing: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// False after a write was interrupted
    pub fn is_clean(&self) -> bool {
        !self.writing
    }

    /// Write one request and return its id
    pub async fn send<P>(&mut self, method: &str, params: Option<&P>) -> HwResult<String>
    where
        P: Serialize + Sync,
    {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let bytes = JadeRequest { id: id.clone(), method, params }.encode()?;

        self.writing = true;
        for chunk in bytes.chunks(WRITE_CHUNK) {
            self.stream.write_all(chunk).await?;
        }
        self.stream.flush().await?;
        self.writing = false;

        self.pending.push_back(id.clone());
        debug!(id = %id, method, len = bytes.len(), "Jade request sent");
        Ok(id)
    }

    /// Wait for the reply to `id`
    pub async fn receive(&mut self, id: &str) -> HwResult<Value> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.wait_for(id)).await {
            Ok(result) => result,
            Err(_) => Err(HwError::Timeout(format!(
                "Jade did not answer request {} within {:?}",
                id, timeout
            ))),
        }
    }

    pub async fn request<P>(&mut self, method: &str, params: Option<&P>) -> HwResult<Value>
    where
        P: Serialize + Sync,
    {
        let id = self.send(method, params).await?;
        self.receive(&id).await
    }

    /// Forget every outstanding request. Returns false when a write was cut
    /// short, the stream is then out of sync and must be reopened.
    pub fn abandon(&mut self) -> bool {
        if !self.pending.is_empty() {
            debug!(ids = ?self.pending, "abandoning Jade requests");
        }
        self.pending.clear();
        self.stash.clear();
        !self.writing
    }

    pub async fn close(&mut self) {
        self.abandon();
        if let Err(e) = self.stream.shutdown().await {
            debug!("Jade stream shutdown: {}", e);
        }
    }

    fn forget(&mut self, id: &str) {
        self.pending.retain(|pending| pending != id);
    }

    async fn wait_for(&mut self, id: &str) -> HwResult<Value> {
        loop {
            if let Some(reply) = self.stash.remove(id) {
                self.forget(id);
                return reply.into_result();
            }

            let reply = self.read_message().await?;
            let reply_id = reply.id.clone();
            match reply_id.as_deref() {
                Some(reply_id) if reply_id == id => {
                    self.forget(id);
                    return reply.into_result();
                }
                Some(reply_id) if self.pending.iter().any(|p| p == reply_id) => {
                    self.stash.insert(reply_id.to_string(), reply);
                }
                Some(reply_id) => debug!(id = reply_id, "discarding reply to an abandoned request"),
                None => warn!("discarding Jade message without id"),
            }
        }
    }

    /// Next non-log map from the device
    async fn read_message(&mut self) -> HwResult<JadeResponse> {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            while let Some(value) = self.decoder.next_value()? {
                match JadeResponse::from_value(&value) {
                    Ok(message) if message.is_log() => {
                        if let Some(log) = &message.log {
                            debug!(target: "jade", "{}", log_text(log));
                        }
                    }
                    Ok(message) => return Ok(message),
                    Err(e) => warn!("skipping Jade message: {}", e),
                }
            }

            let read = self.stream.read(&mut buf).await?;
            if read == 0 {
                return Err(HwError::Transport("Jade closed the serial connection".into()));
            }
            self.decoder.push(&buf[..read]);
        }
    }
}
