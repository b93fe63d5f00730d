//! Fleet configuration.
//!
//! [`FleetConfig`] is read once when the fleet is built and never changes
//! afterwards. All durations are stored as milliseconds so the structure can
//! be loaded from a plain JSON file; accessors convert them to [`Duration`].
//!
//! # Examples
//!
//! ```
//! use cardgate_core::FleetConfig;
//! use std::time::Duration;
//!
//! let config: FleetConfig = serde_json::from_str(r#"{ "max_retries": 4 }"#).unwrap();
//! assert_eq!(config.max_retries, 4);
//! assert_eq!(config.poll_interval(), Duration::from_millis(250));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Timings and limits of the terminal fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Upper bound of one presence/absence wait.
    pub poll_interval_ms: u64,

    /// Delay between card detection and the first command.
    pub settle_delay_ms: u64,

    /// Delay between two read attempts.
    pub retry_interval_ms: u64,

    /// Retries after the first failed read.
    pub max_retries: u32,

    /// How long a successful read stays frozen; negative means indefinitely.
    pub success_display_ms: i64,

    /// Interval between enumeration passes.
    pub rescan_interval_ms: u64,

    /// Backoff when no terminal is attached.
    pub no_readers_retry_ms: u64,

    /// Backoff when the device service was stopped.
    pub service_stopped_retry_ms: u64,

    /// Backoff when no device service is running.
    pub no_service_retry_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            success_display_ms: DEFAULT_SUCCESS_DISPLAY_MS,
            rescan_interval_ms: DEFAULT_RESCAN_INTERVAL_MS,
            no_readers_retry_ms: DEFAULT_NO_READERS_RETRY_MS,
            service_stopped_retry_ms: DEFAULT_SERVICE_STOPPED_RETRY_MS,
            no_service_retry_ms: DEFAULT_NO_SERVICE_RETRY_MS,
        }
    }
}

impl FleetConfig {
    /// Check values that would make the fleet misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfigValue`] if the poll interval or the
    /// rescan interval is zero, since both would turn a wait into a spin.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfigValue {
                key: "poll_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.rescan_interval_ms == 0 {
            return Err(Error::InvalidConfigValue {
                key: "rescan_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// How long to keep a successful result frozen, `None` for indefinitely.
    pub fn success_display(&self) -> Option<Duration> {
        u64::try_from(self.success_display_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn no_readers_retry(&self) -> Duration {
        Duration::from_millis(self.no_readers_retry_ms)
    }

    pub fn service_stopped_retry(&self) -> Duration {
        Duration::from_millis(self.service_stopped_retry_ms)
    }

    pub fn no_service_retry(&self) -> Duration {
        Duration::from_millis(self.no_service_retry_ms)
    }
}
