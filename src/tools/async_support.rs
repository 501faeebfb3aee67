// src/tools/async_support.rs
//! Timeout helpers for device I/O

use crate::core::errors::{HwError, HwResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Timeout for one named operation
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
    pub operation_name: String,
}

impl TimeoutConfig {
    pub fn new(duration: Duration, operation_name: impl Into<String>) -> Self {
        Self { duration, operation_name: operation_name.into() }
    }
}

/// Run `future`, mapping an elapsed deadline to `HwError::Timeout`
pub async fn execute_with_timeout<F, T>(future: F, config: TimeoutConfig) -> HwResult<T>
where
    F: Future<Output = HwResult<T>>,
{
    match timeout(config.duration, future).await {
        Ok(result) => result,
        Err(_) => Err(HwError::Timeout(format!(
            "Operation '{}' timed out after {:?}",
            config.operation_name, config.duration
        ))),
    }
}

/// Measures one device operation
pub struct OperationTimer {
    start_time: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: impl Into<String>) -> Self {
        Self { start_time: Instant::now(), operation_name: operation_name.into() }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start_time.elapsed();
        debug!(operation = %self.operation_name, ?duration, "device operation finished");
        duration
    }
}
