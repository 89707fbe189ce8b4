//! Runtime settings for the gateway worker and its servers
//!
//! Every field has a default, so an empty JSON object is a valid settings
//! file. Durations are given in milliseconds or seconds as the field name
//! says.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Timing, server tuning and queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySettings {
    /// Delay before the worker loads gateways, so dependencies can come up
    pub startup_delay_secs: u64,
    /// Outward sync period
    pub sync_interval_ms: u64,
    /// Status publication period
    pub status_interval_secs: u64,
    /// How often the worker asks whether the items cache is stale
    pub cache_check_interval_secs: u64,
    /// Age after which the items cache is reloaded
    pub cache_max_age_secs: u64,
    /// Pause between stop and start when restarting a gateway
    pub restart_delay_ms: u64,
    pub max_connections: usize,
    pub request_timeout_secs: u64,
    /// Hex-dump every frame each server sends and receives
    pub packet_logging: bool,
    /// Capacity of each instance's inbound write queue
    pub write_queue_capacity: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            startup_delay_secs: 5,
            sync_interval_ms: 500,
            status_interval_secs: 5,
            cache_check_interval_secs: 60,
            cache_max_age_secs: 60,
            restart_delay_ms: 1000,
            max_connections: 100,
            request_timeout_secs: 30,
            packet_logging: false,
            write_queue_capacity: 256,
        }
    }
}

impl GatewaySettings {
    /// Load settings from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::io(format!("Failed to read {}: {}", path.display(), e)))?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would spin a loop or stall every queue
    pub fn validate(&self) -> GatewayResult<()> {
        if self.sync_interval_ms == 0 {
            return Err(GatewayError::configuration("syncIntervalMs must be greater than 0"));
        }
        if self.status_interval_secs == 0 || self.cache_check_interval_secs == 0 {
            return Err(GatewayError::configuration("status and cache check intervals must be greater than 0"));
        }
        if self.write_queue_capacity == 0 {
            return Err(GatewayError::configuration("writeQueueCapacity must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(GatewayError::configuration("maxConnections must be greater than 0"));
        }
        Ok(())
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn cache_check_interval(&self) -> Duration {
        Duration::from_secs(self.cache_check_interval_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
