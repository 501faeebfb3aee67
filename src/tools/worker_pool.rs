// src/tools/worker_pool.rs
//! Fixed-size async worker pool
//!
//! Device clients submit blocking or long-running I/O here instead of
//! spawning ad hoc tasks. The pool is sized explicitly and its queue is
//! bounded, so a flood of requests applies backpressure to the submitter.

use crate::core::errors::{HwError, HwResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Handler executed on a pool task
#[async_trait]
pub trait Worker<In, Out>: Send + Sync {
    async fn process(&self, input: In) -> Out;
}

type Callback<Out> = Box<dyn FnOnce(Out) + Send>;

enum Reply<Out> {
    Channel(oneshot::Sender<Out>),
    Callback(Callback<Out>),
}

struct Job<In, Out> {
    input: In,
    reply: Reply<Out>,
}

pub struct WorkerPool<In, Out> {
    name: String,
    sender: mpsc::Sender<Job<In, Out>>,
    handles: Vec<JoinHandle<()>>,
}

impl<In, Out> WorkerPool<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Spawn `size` tasks draining a queue of `queue_depth` jobs
    pub fn new(
        name: impl Into<String>,
        size: usize,
        queue_depth: usize,
        worker: Arc<dyn Worker<In, Out>>,
    ) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job<In, Out>>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..size)
            .map(|n| {
                let receiver = Arc::clone(&receiver);
                let worker = Arc::clone(&worker);
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!(pool = %pool, worker = n, "queue closed, worker exiting");
                            break;
                        };
                        let output = worker.process(job.input).await;
                        match job.reply {
                            Reply::Channel(tx) => {
                                if tx.send(output).is_err() {
                                    debug!(pool = %pool, "submitter went away before the result");
                                }
                            }
                            Reply::Callback(cb) => cb(output),
                        }
                    }
                })
            })
            .collect();

        debug!(pool = %name, size, queue_depth, "worker pool started");
        Self { name, sender, handles }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    async fn enqueue(&self, job: Job<In, Out>) -> HwResult<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| HwError::Internal(format!("worker pool '{}' is not running", self.name)))
    }

    /// Queue `input` and wait for its result
    pub async fn submit(&self, input: In) -> HwResult<Out> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Job { input, reply: Reply::Channel(tx) }).await?;
        rx.await
            .map_err(|_| HwError::Internal(format!("worker pool '{}' dropped a job", self.name)))
    }

    /// Queue `input`; `callback` runs on the pool task with the result
    pub async fn submit_with_callback<F>(&self, input: In, callback: F) -> HwResult<()>
    where
        F: FnOnce(Out) + Send + 'static,
    {
        self.enqueue(Job { input, reply: Reply::Callback(Box::new(callback)) }).await
    }
}

impl<In, Out> Drop for WorkerPool<In, Out> {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
