//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for monitoring CSI operations, array sessions and
//! lock contention.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Number of retried array calls
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
    /// Counter: Array login attempts by host and outcome
    pub const ARRAY_LOGINS_TOTAL: &str = "synology_array_logins_total";
    /// Gauge: Array session status (1 = logged in, 0 = not)
    pub const ARRAY_SESSION_UP: &str = "synology_array_session_up";
    /// Counter: Requests rejected because a volume lock was busy
    pub const CSI_LOCK_TIMEOUTS_TOTAL: &str = "csi_lock_timeouts_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record an array login attempt
pub fn record_login(host: &str, success: bool) {
    counter!(names::ARRAY_LOGINS_TOTAL, "host" => host.to_string(), "success" => success.to_string())
        .increment(1);
}

/// Record whether an array currently has a session
pub fn set_session_up(host: &str, up: bool) {
    gauge!(names::ARRAY_SESSION_UP, "host" => host.to_string()).set(if up { 1.0 } else { 0.0 });
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a lock acquisition timeout
pub fn record_lock_timeout() {
    counter!(names::CSI_LOCK_TIMEOUTS_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        // Without an installed recorder these are no-ops; just verify they don't panic
        OperationTimer::new("create_volume").success();
        OperationTimer::new("create_volume").failure("NotFound");
        record_login("nas1", true);
        set_session_up("nas1", false);
        record_lock_timeout();
    }
}
