//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Process-wide settings, fixed once the engine starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Timeout used when a run does not request one
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    /// Upper bound for any requested timeout
    #[serde(with = "duration_ms")]
    pub max_timeout: Duration,
    /// Maximum number of live contexts
    pub max_contexts: usize,
    /// Record console output into execution results
    pub console_capture: bool,
    /// Sample heap usage and enforce the memory ceiling pre-flight
    pub memory_monitoring: bool,
    /// Heap ceiling in megabytes
    pub memory_limit_mb: u64,
    /// Maximum captured console output per run, in bytes
    pub max_console_bytes: usize,
    /// Run the static pattern scan before every execution
    pub security_scan: bool,
    /// Contexts unused for longer than this are evicted
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Period of the idle sweep
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            max_contexts: 100,
            console_capture: true,
            memory_monitoring: true,
            memory_limit_mb: 128,
            max_console_bytes: 1024 * 1024, // 1 MB output
            security_scan: false,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Check the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_timeout.is_zero() {
            return Err(Error::context_error("maxTimeout must be at least 1ms"));
        }
        if self.max_contexts == 0 {
            return Err(Error::context_error("maxContexts must be at least 1"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::context_error("sweepInterval must be at least 1ms"));
        }
        Ok(())
    }

    /// Timeout actually applied to a run.
    ///
    /// `min(requested or default, max)`, never below one millisecond.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let requested = requested_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(self.default_timeout);
        requested.min(self.max_timeout).max(Duration::from_millis(1))
    }

    /// Memory ceiling in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
