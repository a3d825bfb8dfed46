// Copyright 2020 Joyent, Inc.

//! Runtime configuration for clients and servers.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{FastError, Result};
use crate::protocol::{FP_HEADER_SZ, MAX_DATAGRAM_SIZE};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:0";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 10_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 50;
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 1024;
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Settings shared by a `Client` or `Server` and its sub-components.
///
/// Read-only once handed to a client or server; both keep it behind an
/// `Arc`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FastConfig {
    /// Local address to bind.
    pub bind_address: String,
    /// Time to wait for a reply before each retransmission.
    pub request_timeout_ms: u64,
    /// Retransmissions after the first send.
    pub max_retries: u32,
    /// Outstanding request limit per client.
    pub max_pending_requests: usize,
    /// Period of the client retry sweep.
    pub sweep_interval_ms: u64,
    /// Handlers allowed to run at once on a server.
    pub max_concurrent_handlers: usize,
    /// How long a server remembers answered correlation ids. Zero means
    /// the full retry window of a client using this same config.
    pub dedup_window_ms: u64,
    /// Answered Responses a server keeps for replay; the oldest go first.
    pub dedup_capacity: usize,
    pub max_datagram_size: usize,
}

impl Default for FastConfig {
    fn default() -> Self {
        FastConfig {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            dedup_window_ms: 0,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl FastConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<FastConfig> {
        let config: FastConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(FastError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(FastError::Config(
                "max_pending_requests must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(FastError::Config(
                "max_concurrent_handlers must be greater than zero".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(FastError::Config(
                "dedup_capacity must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(FastError::Config(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_datagram_size <= FP_HEADER_SZ
            || self.max_datagram_size > MAX_DATAGRAM_SIZE
        {
            return Err(FastError::Config(format!(
                "max_datagram_size must be in ({}, {}]",
                FP_HEADER_SZ, MAX_DATAGRAM_SIZE
            )));
        }
        Ok(())
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Effective de-duplication window on the server.
    pub fn dedup_window(&self) -> Duration {
        if self.dedup_window_ms > 0 {
            Duration::from_millis(self.dedup_window_ms)
        } else {
            let attempts = u64::from(self.max_retries) + 1;
            Duration::from_millis(self.request_timeout_ms.saturating_mul(attempts))
        }
    }
}
