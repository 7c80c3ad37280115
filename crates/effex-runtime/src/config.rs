//! Runtime configuration
//!
//! # Environment Variables
//!
//! - `EFFEX_WORKERS=<n>` - worker thread count (default: CPU count)
//! - `EFFEX_PARK_TIMEOUT_MS=<ms>` - idle worker park timeout (default: 10)
//! - `EFFEX_TIMER_POLL_MS=<ms>` - max timer thread sleep (default: 10)

use std::time::Duration;

use effex_core::env::{env_get, env_get_duration_ms};

use crate::error::{ConfigError, MAX_WORKERS};

/// Configuration for a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of worker threads (defaults to CPU count)
    pub num_workers: usize,

    /// How long an idle worker sleeps before re-checking the queue
    pub park_timeout: Duration,

    /// Prefix for thread names: `<prefix>-worker-<i>`, `<prefix>-timer`
    pub thread_name_prefix: String,

    /// Upper bound on the timer thread's sleep between polls
    pub timer_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus.min(MAX_WORKERS),
            park_timeout: Duration::from_millis(10),
            thread_name_prefix: "effex".into(),
            timer_poll_interval: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EFFEX_*` environment variables
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            num_workers: env_get("EFFEX_WORKERS", base.num_workers),
            park_timeout: env_get_duration_ms("EFFEX_PARK_TIMEOUT_MS", base.park_timeout),
            timer_poll_interval: env_get_duration_ms("EFFEX_TIMER_POLL_MS", base.timer_poll_interval),
            ..base
        }
    }

    /// Set number of worker threads
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Set idle park timeout
    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    /// Set thread name prefix
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set timer poll interval
    pub fn timer_poll_interval(mut self, d: Duration) -> Self {
        self.timer_poll_interval = d;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers(self.num_workers));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::ZeroParkTimeout);
        }
        if self.timer_poll_interval.is_zero() {
            return Err(ConfigError::ZeroTimerPoll);
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        Ok(())
    }

    pub(crate) fn worker_thread_name(&self, index: usize) -> String {
        format!("{}-worker-{}", self.thread_name_prefix, index)
    }

    pub(crate) fn timer_thread_name(&self) -> String {
        format!("{}-timer", self.thread_name_prefix)
    }
}
