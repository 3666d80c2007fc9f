//! Prometheus metrics for snapshot operations
//!
//! Provides metrics for monitoring backend operations per storage technology.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total snapshot operations by backend, operation and status
    pub const SNAPSHOT_OPERATIONS_TOTAL: &str = "brick_snapshot_operations_total";
    /// Histogram: Duration of snapshot operations in seconds
    pub const SNAPSHOT_OPERATION_DURATION_SECONDS: &str =
        "brick_snapshot_operation_duration_seconds";
    /// Counter: Failed unmount attempts during snapshot removal
    pub const UNMOUNT_RETRIES_TOTAL: &str = "brick_snapshot_unmount_retries_total";
    /// Gauge: Brick operations currently holding a worker permit
    pub const CONCURRENT_OPERATIONS: &str = "brick_snapshot_concurrent_operations";
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

/// Record a snapshot operation with its result
pub fn record_operation(backend: &str, operation: &str, status: &str, duration_secs: f64) {
    counter!(
        names::SNAPSHOT_OPERATIONS_TOTAL,
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        names::SNAPSHOT_OPERATION_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record one failed unmount attempt
pub fn record_unmount_retry(backend: &str) {
    counter!(names::UNMOUNT_RETRIES_TOTAL, "backend" => backend.to_string()).increment(1);
}

/// Update the concurrent operations gauge
pub fn set_concurrent_ops(count: usize) {
    gauge!(names::CONCURRENT_OPERATIONS).set(count as f64);
}

/// Helper for timing operations
pub struct OperationTimer {
    backend: String,
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(backend: &str, operation: &str) -> Self {
        Self {
            backend: backend.to_string(),
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.backend, &self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.backend, &self.operation, error_code, duration);
    }
}
