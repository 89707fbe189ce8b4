/// Utility functions and helpers for gateway operations
///
/// Timing helpers for the periodic loops and address validation shared by
/// the server and the mapping model.

use std::time::{Duration, Instant};
use log::{debug, warn};
use crate::error::{GatewayError, GatewayResult};

/// Timing metrics for a repeated operation such as a sync pass
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful run
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_runs += 1;
        self.record(duration);
    }

    /// Record a failed run
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_runs += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_runs += 1;
        self.total_duration += duration;

        self.min_duration = Some(
            self.min_duration.map_or(duration, |min| min.min(duration))
        );
        self.max_duration = Some(
            self.max_duration.map_or(duration, |max| max.max(duration))
        );

        self.avg_duration = self.total_duration / self.total_runs as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        (self.successful_runs as f64 / self.total_runs as f64) * 100.0
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop the timer and warn when the run overshot `budget`
    ///
    /// The sync loop uses this to flag passes that take longer than the
    /// loop period.
    pub fn stop_with_budget(self, budget: Duration) -> Duration {
        let duration = self.start.elapsed();
        if duration > budget {
            warn!(
                "Operation '{}' took {} (budget {})",
                self.operation_name,
                format::format_duration(duration),
                format::format_duration(budget)
            );
        } else {
            debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate a Modbus TCP unit identifier
    ///
    /// 0 and 255 are accepted alongside the serial range 1-247 since TCP
    /// gateways commonly answer on them.
    pub fn validate_unit_id(unit_id: u8) -> GatewayResult<()> {
        if (248..=254).contains(&unit_id) {
            return Err(GatewayError::configuration(
                format!("Invalid unit ID: {} (must be 0-247 or 255)", unit_id)
            ));
        }
        Ok(())
    }

    /// Validate that `count` addresses starting at `start` fit in 0-65535
    pub fn validate_address_range(start: u16, count: u16) -> GatewayResult<()> {
        if count == 0 {
            return Err(GatewayError::invalid_address(start, count));
        }

        if (start as u32 + count as u32) > 65536 {
            return Err(GatewayError::invalid_address(start, count));
        }

        Ok(())
    }

    /// Validate register count for read/write operations
    pub fn validate_register_count(count: u16) -> GatewayResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(GatewayError::invalid_data(
                format!("Invalid register count: {} (must be 1-{})", count, crate::MAX_REGISTERS_PER_REQUEST)
            ));
        }
        Ok(())
    }

    /// Validate coil count for read/write operations
    pub fn validate_coil_count(count: u16) -> GatewayResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(GatewayError::invalid_data(
                format!("Invalid coil count: {} (must be 1-{})", count, crate::MAX_COILS_PER_REQUEST)
            ));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}
