//! Metrics for connector operations.
//!
//! Recorded through the `metrics` facade; the embedding agent decides which
//! recorder (if any) to install.

use std::time::Instant;

use metrics::{counter, histogram};

use crate::protocol::Protocol;

/// Metric names
pub mod names {
    /// Counter: connect/disconnect calls by protocol, operation and status
    pub const BRICK_OPERATIONS_TOTAL: &str = "brick_operations_total";
    /// Histogram: duration of connect/disconnect calls in seconds
    pub const BRICK_OPERATION_DURATION_SECONDS: &str = "brick_operation_duration_seconds";
    /// Counter: device rescans triggered while waiting for a volume
    pub const BRICK_DEVICE_RESCANS_TOTAL: &str = "brick_device_rescans_total";
}

/// Record a connector operation with its result
pub fn record_operation(protocol: Protocol, operation: &str, status: &str, duration_secs: f64) {
    counter!(
        names::BRICK_OPERATIONS_TOTAL,
        "protocol" => protocol.as_str(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        names::BRICK_OPERATION_DURATION_SECONDS,
        "protocol" => protocol.as_str(),
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record a rescan issued while polling for a device
pub fn record_rescan(protocol: Protocol) {
    counter!(names::BRICK_DEVICE_RESCANS_TOTAL, "protocol" => protocol.as_str()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    protocol: Protocol,
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(protocol: Protocol, operation: &'static str) -> Self {
        Self {
            protocol,
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.protocol, self.operation, "success", duration);
    }

    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.protocol, self.operation, status, duration);
    }

    /// Finish the timer from an operation result.
    pub fn finish<T, E>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.success(),
            Err(_) => self.failure("error"),
        }
    }
}
