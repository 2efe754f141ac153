use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use transit_core::{PoolStatus, StoreError};

/// Pool limits, deserialized from the `pool` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub test_before_acquire: bool,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

fn default_min_idle() -> u32 { 2 }
fn default_max_size() -> u32 { 10 }
fn default_acquire_timeout_ms() -> u64 { 3000 }
fn default_lock_timeout_ms() -> u64 { 5000 }
fn default_true() -> bool { true }

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: default_min_idle(),
            max_size: default_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            test_before_acquire: true,
            idle_timeout_ms: None,
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_size == 0 {
            return Err(StoreError::Backend("pool.max_size must be at least 1".into()));
        }
        if self.min_idle > self.max_size {
            return Err(StoreError::Backend(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        Ok(())
    }
}

/// Concurrency bound for the in-process store.
///
/// Hands out at most `max_size` slots; further callers wait up to
/// `acquire_timeout` and then fail with `PoolExhausted`. A slot is released
/// when its permit drops.
#[derive(Clone)]
pub struct SessionLimiter {
    permits: Arc<Semaphore>,
    settings: PoolSettings,
    closed: Arc<AtomicBool>,
}

impl SessionLimiter {
    pub fn new(settings: PoolSettings) -> Result<Self, StoreError> {
        settings.validate()?;
        info!(max_size = settings.max_size, "Session limiter ready");
        Ok(Self {
            permits: Arc::new(Semaphore::new(settings.max_size as usize)),
            settings,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, StoreError> {
        let timeout = self.settings.acquire_timeout();
        match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StoreError::PoolClosed),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Session pool exhausted");
                Err(StoreError::PoolExhausted(timeout))
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let max_size = self.settings.max_size as usize;
        let free = self.permits.available_permits().min(max_size);
        PoolStatus {
            min_idle: self.settings.min_idle as usize,
            max_size,
            acquire_timeout: self.settings.acquire_timeout(),
            lock_timeout: self.settings.lock_timeout(),
            idle: free,
            in_use: max_size - free,
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    /// Reject further acquisitions. Slots already handed out stay valid.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            info!("Session limiter closed");
        }
    }
}
