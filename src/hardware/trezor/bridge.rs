//! Trezor Bridge HTTP client
//!
//! Every bridge endpoint is a `POST` with an `Origin` header. Requests run on
//! the client's worker pool; `HttpBridge` is the production worker.

use super::messages::TrezorMessage;
use crate::core::config::TrezorConfig;
use crate::core::errors::{HwError, HwResult};
use crate::tools::worker_pool::{Worker, WorkerPool};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ORIGIN};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct BridgeRequest {
    pub path: String,
    pub body: Option<String>,
    pub timeout: Duration,
}

pub type BridgePool = WorkerPool<BridgeRequest, HwResult<String>>;

pub struct HttpBridge {
    client: Client,
    base_url: String,
    origin: String,
}

impl HttpBridge {
    pub fn new(config: &TrezorConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            origin: config.origin.clone(),
        }
    }
}

#[async_trait]
impl Worker<BridgeRequest, HwResult<String>> for HttpBridge {
    async fn process(&self, request: BridgeRequest) -> HwResult<String> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .post(&url)
            .header(ORIGIN, &self.origin)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(HwError::Network(format!(
                "bridge {} returned {}: {}",
                request.path,
                status,
                text.trim()
            )));
        }
        debug!(path = %request.path, len = text.len(), "bridge response");
        Ok(text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeInfo {
    pub version: String,
}

/// Entry of `/enumerate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeDevice {
    pub path: String,
    #[serde(default)]
    pub vendor: Option<u32>,
    #[serde(default)]
    pub product: Option<u32>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, rename = "debugSession")]
    pub debug_session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcquireReply {
    #[serde(default)]
    session: Option<String>,
}

/// Typed endpoints over a bridge worker pool
#[derive(Clone)]
pub struct BridgeClient {
    pool: Arc<BridgePool>,
    init_timeout: Duration,
    call_timeout: Duration,
}

impl BridgeClient {
    pub fn new(pool: Arc<BridgePool>, config: &TrezorConfig) -> Self {
        Self { pool, init_timeout: config.init_timeout(), call_timeout: config.call_timeout() }
    }

    async fn post(&self, path: String, body: Option<String>, timeout: Duration) -> HwResult<String> {
        self.pool.submit(BridgeRequest { path, body, timeout }).await?
    }

    /// `POST /`
    pub async fn version(&self) -> HwResult<String> {
        let raw = self.post("/".into(), None, self.init_timeout).await?;
        let info: BridgeInfo = serde_json::from_str(&raw)?;
        info!("✅ Trezor bridge version {}", info.version);
        Ok(info.version)
    }

    pub async fn enumerate(&self) -> HwResult<Vec<BridgeDevice>> {
        let raw = self.post("/enumerate".into(), None, self.call_timeout).await?;
        let devices: Vec<BridgeDevice> = serde_json::from_str(&raw)?;
        debug!("bridge enumerated {} device(s)", devices.len());
        Ok(devices)
    }

    /// New session for `path`; the bridge must hand out a fresh one
    pub async fn acquire(&self, path: &str, previous: Option<&str>) -> HwResult<String> {
        let previous_id = previous.filter(|s| !s.is_empty()).unwrap_or("null");
        let raw = self
            .post(format!("/acquire/{}/{}", path, previous_id), None, self.call_timeout)
            .await?;
        let reply: AcquireReply = serde_json::from_str(&raw)?;
        match reply.session {
            Some(session) if !session.is_empty() && session != previous_id => {
                info!(path, old = previous_id, new = %session, "Trezor session acquired");
                Ok(session)
            }
            _ => Err(HwError::Protocol(format!("cannot acquire Trezor at {}", path))),
        }
    }

    pub async fn release(&self, session: &str) -> HwResult<()> {
        self.post(format!("/release/{}", session), None, self.call_timeout).await?;
        info!(session, "Trezor session released");
        Ok(())
    }

    pub async fn call(&self, session: &str, message: &TrezorMessage) -> HwResult<TrezorMessage> {
        debug!(session, ?message, "bridge call");
        let raw = self
            .post(format!("/call/{}", session), Some(message.pack()), self.call_timeout)
            .await?;
        TrezorMessage::unpack(&raw)
    }

    /// Queue a call without waiting for it; `on_reply` runs on the pool task
    pub async fn call_detached<F>(&self, session: &str, message: &TrezorMessage, on_reply: F) -> HwResult<()>
    where
        F: FnOnce(HwResult<TrezorMessage>) + Send + 'static,
    {
        debug!(session, ?message, "bridge call, detached");
        let request = BridgeRequest {
            path: format!("/call/{}", session),
            body: Some(message.pack()),
            timeout: self.init_timeout,
        };
        self.pool
            .submit_with_callback(request, move |raw| on_reply(raw.and_then(|raw| TrezorMessage::unpack(&raw))))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_entry_parsing() {
        let raw = r#"[{"path":"1","vendor":21324,"product":1,"session":null,"debug":false,"debugSession":null},
                      {"path":"2","session":"7"}]"#;
        let devices: Vec<BridgeDevice> = serde_json::from_str(raw).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].vendor, Some(21324));
        assert_eq!(devices[0].session, None);
        assert_eq!(devices[1].session.as_deref(), Some("7"));
        assert!(!devices[1].debug);
    }
}
