// src/tools/mod.rs

pub mod async_support;
pub mod worker_pool;

pub use async_support::{execute_with_timeout, TimeoutConfig};
pub use worker_pool::{Worker, WorkerPool};
