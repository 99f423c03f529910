//! Per-operation metrics for an external sink
//!
//! The engine reports one [`OperationMetric`] per public operation. Sinks
//! are fire-and-forget: a panicking sink is caught and ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use serde::Serialize;

use crate::query::Complexity;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetric {
    pub operation: &'static str,
    pub duration_ms: u64,
    pub records_processed: usize,
    pub query_complexity: Option<Complexity>,
}

/// Receives operation metrics. Must not block.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, metric: &OperationMetric);
}

/// Default sink: emits a `tracing` event per operation
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, metric: &OperationMetric) {
        tracing::debug!(
            target: "kbsearch::telemetry",
            operation = metric.operation,
            duration_ms = metric.duration_ms,
            records = metric.records_processed,
            complexity = metric.query_complexity.map(|c| c.to_string()),
            "operation"
        );
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _metric: &OperationMetric) {}
}

/// Keeps metrics in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct MemorySink {
    metrics: Mutex<Vec<OperationMetric>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<OperationMetric> {
        std::mem::take(&mut *self.metrics.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, metric: &OperationMetric) {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metric.clone());
    }
}

/// Hand a metric to `sink`, swallowing panics
pub(crate) fn emit(sink: &dyn TelemetrySink, metric: OperationMetric) {
    if catch_unwind(AssertUnwindSafe(|| sink.record(&metric))).is_err() {
        tracing::debug!(operation = metric.operation, "Telemetry sink panicked, metric dropped");
    }
}
