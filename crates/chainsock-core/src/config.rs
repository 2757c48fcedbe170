//! Provider configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::policy::{BackoffPolicy, ListenerFaultPolicy};

/// Configuration for a persistent-connection provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Upper bound on the wait for a single response, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Total attempts made by `connect()` before giving up.
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    /// Delay after the first failed connection attempt, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Growth factor for the connection retry delay.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on any single connection retry delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Keep the listener alive on errors (lenient) instead of failing the connection (strict).
    #[serde(default)]
    pub silence_listener_task_exceptions: bool,
    /// Max bytes pulled from a byte-stream socket per read.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_max_connection_retries() -> u32 { 5 }
fn default_backoff_base_ms() -> u64 { 1_750 }
fn default_backoff_multiplier() -> f64 { 1.75 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_read_chunk_size() -> usize { 4_096 }

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_connection_retries: default_max_connection_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            silence_listener_task_exceptions: false,
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl ProviderConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json_str(s: &str) -> Result<Self, ProviderError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.max_connection_retries == 0 {
            return Err(ProviderError::Other("max_connection_retries must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ProviderError::Other("request_timeout_ms must be positive".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ProviderError::Other("backoff_multiplier must be finite and >= 1.0".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ProviderError::Other("backoff_max_ms must be >= backoff_base_ms".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ProviderError::Other("read_chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.backoff_max_ms),
            max_attempts: self.max_connection_retries,
        }
    }

    pub fn listener_policy(&self) -> ListenerFaultPolicy {
        ListenerFaultPolicy::from_silenced(self.silence_listener_task_exceptions)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_connection_retries(mut self, retries: u32) -> Self {
        self.max_connection_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, multiplier: f64) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_listener_policy(mut self, policy: ListenerFaultPolicy) -> Self {
        self.silence_listener_task_exceptions = policy == ListenerFaultPolicy::Lenient;
        self
    }
}
