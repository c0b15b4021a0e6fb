//! Upload manager configuration.
//!
//! Built in code via [`ManagerConfig::default`] or loaded from a JSON file
//! where durations are written in milliseconds and missing fields take their
//! defaults:
//!
//! ```json
//! { "chunk_size": 8388608, "concurrency_limit": 4, "base_delay_ms": 100 }
//! ```

use std::path::Path;
use std::time::Duration;

use chunkyard_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::retry::RetryPolicy;

/// Default number of uploads allowed to be `Active` at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;

/// Default number of chunks in flight per upload.
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 1;

/// Default per-attempt timeout for a chunk, whole-object or finalize call.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Static configuration of an [`UploadManager`](crate::UploadManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Bytes per chunk; payloads no larger than this go in one request.
    /// Default 5 MiB.
    pub chunk_size: u64,
    /// Maximum uploads `Active` at once, regardless of size. Default 3.
    pub concurrency_limit: usize,
    /// Chunks in flight per upload. Default 1 (sequential within an upload).
    pub chunk_concurrency: usize,
    /// Retries per chunk (and for finalize). Default 3.
    pub max_attempts: u32,
    /// First backoff delay. Default 250 ms.
    pub base_delay: Duration,
    /// Backoff cap. Default 15 s.
    pub max_delay: Duration,
    /// Deadline for a single transport call. Default 120 s.
    pub per_attempt_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            max_attempts: retry.max_attempts,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            per_attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    /// Checks every field; called by the manager at construction.
    pub fn validate(&self) -> Result<(), UploadError> {
        let invalid = |msg: &str| Err(UploadError::InvalidConfiguration(msg.into()));
        if self.chunk_size == 0 {
            return invalid("chunk_size must be at least 1 byte");
        }
        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be at least 1");
        }
        if self.chunk_concurrency == 0 {
            return invalid("chunk_concurrency must be at least 1");
        }
        if self.base_delay > self.max_delay {
            return invalid("base_delay must not exceed max_delay");
        }
        if self.per_attempt_timeout.is_zero() {
            return invalid("per_attempt_timeout must be positive");
        }
        Ok(())
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_attempts,
        }
    }

    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UploadError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates the JSON form.
    pub fn from_json(content: &str) -> Result<Self, UploadError> {
        let file: ManagerConfigFile = serde_json::from_str(content)
            .map_err(|e| UploadError::InvalidConfiguration(format!("malformed config: {e}")))?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Serializes to the JSON form accepted by [`ManagerConfig::from_json`].
    pub fn to_json(&self) -> Result<String, UploadError> {
        serde_json::to_string_pretty(&ManagerConfigFile::from(self))
            .map_err(|e| UploadError::InvalidConfiguration(e.to_string()))
    }
}

/// On-disk form of [`ManagerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ManagerConfigFile {
    chunk_size: u64,
    concurrency_limit: usize,
    chunk_concurrency: usize,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    per_attempt_timeout_ms: u64,
}

impl Default for ManagerConfigFile {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for ManagerConfigFile {
    fn from(c: &ManagerConfig) -> Self {
        Self {
            chunk_size: c.chunk_size,
            concurrency_limit: c.concurrency_limit,
            chunk_concurrency: c.chunk_concurrency,
            max_attempts: c.max_attempts,
            base_delay_ms: c.base_delay.as_millis() as u64,
            max_delay_ms: c.max_delay.as_millis() as u64,
            per_attempt_timeout_ms: c.per_attempt_timeout.as_millis() as u64,
        }
    }
}

impl From<ManagerConfigFile> for ManagerConfig {
    fn from(f: ManagerConfigFile) -> Self {
        Self {
            chunk_size: f.chunk_size,
            concurrency_limit: f.concurrency_limit,
            chunk_concurrency: f.chunk_concurrency,
            max_attempts: f.max_attempts,
            base_delay: Duration::from_millis(f.base_delay_ms),
            max_delay: Duration::from_millis(f.max_delay_ms),
            per_attempt_timeout: Duration::from_millis(f.per_attempt_timeout_ms),
        }
    }
}
