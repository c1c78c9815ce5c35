use std::time::Duration;

use loopd_types::{SwapState, SwapType};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::*;

/// Metrics collector for the loop swap daemon
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SWAP METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Set the number of swaps held in the registry
    pub fn set_swaps_tracked(&self, count: usize) {
        SWAPS_TRACKED.set(count as i64);
    }

    /// Record a status update received from the backend
    pub fn record_status_update(&self, state: SwapState) {
        SWAP_STATUS_UPDATES
            .with_label_values(&[state.as_str()])
            .inc();
    }

    /// Record a swap initiated through the API
    pub fn record_swap_initiated(&self, swap_type: SwapType) {
        let label = match swap_type {
            SwapType::LoopOut => "loop_out",
            SwapType::LoopIn => "loop_in",
        };
        SWAPS_INITIATED.with_label_values(&[label]).inc();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SUBSCRIBER METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn subscriber_added(&self) {
        ACTIVE_SUBSCRIBERS.inc();
    }

    pub fn subscriber_removed(&self) {
        ACTIVE_SUBSCRIBERS.dec();
    }

    pub fn record_dropped_update(&self) {
        DROPPED_UPDATES.inc();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RPC METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record a finished RPC call
    pub fn record_rpc_call(&self, method: &str, code: &str, latency: Duration) {
        RPC_CALLS.with_label_values(&[method, code]).inc();
        RPC_LATENCY
            .with_label_values(&[method])
            .observe(latency.as_millis() as f64);
    }

    /// Record a call rejected by access control
    pub fn record_auth_rejection(&self, method: &str) {
        AUTH_REJECTIONS.with_label_values(&[method]).inc();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DAEMON METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn task_started(&self, task: &str) {
        BACKGROUND_TASKS.with_label_values(&[task]).inc();
    }

    pub fn task_stopped(&self, task: &str) {
        BACKGROUND_TASKS.with_label_values(&[task]).dec();
    }

    pub fn record_runtime_failure(&self, task: &str) {
        RUNTIME_FAILURES.with_label_values(&[task]).inc();
    }

    pub fn record_error_logged(&self, target: &str) {
        ERRORS_LOGGED.with_label_values(&[target]).inc();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXPORT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Export metrics in Prometheus text format
    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingError(e.to_string()))
    }
}

/// Metrics error types
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("encoding error: {0}")]
    EncodingError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_swap_metrics() {
        let collector = MetricsCollector::new();

        collector.set_swaps_tracked(3);
        collector.record_status_update(SwapState::HtlcPublished);
        collector.record_swap_initiated(SwapType::LoopIn);

        let metrics = collector.export_metrics().unwrap();
        assert!(metrics.contains("loopd_swaps_tracked"));
        assert!(metrics.contains("loopd_swap_status_updates_total"));
        assert!(metrics.contains("htlc_published"));
        assert!(metrics.contains("loop_in"));
    }

    #[test]
    fn test_record_rpc_metrics() {
        let collector = MetricsCollector::new();

        collector.record_rpc_call("/looprpc.SwapClient/ListSwaps", "ok", Duration::from_millis(3));
        collector.record_auth_rejection("/looprpc.SwapClient/LoopOut");

        let metrics = collector.export_metrics().unwrap();
        assert!(metrics.contains("loopd_rpc_calls_total"));
        assert!(metrics.contains("loopd_rpc_latency_ms"));
        assert!(metrics.contains("loopd_auth_rejections_total"));
    }

    #[test]
    fn test_task_gauge() {
        let collector = MetricsCollector::new();

        collector.task_started("test-task-gauge");
        assert_eq!(
            BACKGROUND_TASKS.with_label_values(&["test-task-gauge"]).get(),
            1
        );
        collector.task_stopped("test-task-gauge");
        assert_eq!(
            BACKGROUND_TASKS.with_label_values(&["test-task-gauge"]).get(),
            0
        );
    }
}
