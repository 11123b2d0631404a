//! Background workers, cooperative cancellation and the wall clock

use crate::error::{ConsensusError, Result};
use crate::types::Timestamp;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Milliseconds since the Unix epoch
pub fn current_timestamp() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Shared cancellation flag polled by long-running loops
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConsensusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep up to `duration`, waking early on cancellation.
    /// Returns false when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let step = Duration::from_millis(10);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let nap = remaining.min(step);
            thread::sleep(nap);
            remaining -= nap;
        }
        !self.is_cancelled()
    }
}

/// A named thread driven by a cancellation token
#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body`, handing it the worker's token
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_token))
            .map_err(|e| ConsensusError::WorkerSpawn(format!("{}: {}", name, e)))?;
        debug!("Started worker {}", name);
        Ok(Self { name: name.to_string(), token, handle: Some(handle) })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel and join
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} panicked", self.name);
            } else {
                debug!("Stopped worker {}", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
