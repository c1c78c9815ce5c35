use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    // ═══════════════════════════════════════════════════════════════════════════
    // SWAP METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Number of swaps currently held in the registry
    pub static ref SWAPS_TRACKED: IntGauge = register_int_gauge!(
        "loopd_swaps_tracked",
        "Number of swaps held in the swap registry"
    )
    .unwrap();

    /// Swap status updates received from the backend, by state
    pub static ref SWAP_STATUS_UPDATES: IntCounterVec = register_int_counter_vec!(
        "loopd_swap_status_updates_total",
        "Swap status updates received from the backend",
        &["state"]
    )
    .unwrap();

    /// Swaps initiated through the API, by direction
    pub static ref SWAPS_INITIATED: IntCounterVec = register_int_counter_vec!(
        "loopd_swaps_initiated_total",
        "Swaps initiated through the API",
        &["swap_type"]
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // SUBSCRIBER METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Number of active status subscribers
    pub static ref ACTIVE_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "loopd_status_subscribers",
        "Number of active status subscribers"
    )
    .unwrap();

    /// Updates dropped because a subscriber queue was full
    pub static ref DROPPED_UPDATES: IntCounter = register_int_counter!(
        "loopd_status_updates_dropped_total",
        "Status updates dropped for slow subscribers"
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // RPC METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// RPC calls by method and result code
    pub static ref RPC_CALLS: IntCounterVec = register_int_counter_vec!(
        "loopd_rpc_calls_total",
        "RPC calls by method and result code",
        &["method", "code"]
    )
    .unwrap();

    /// RPC call latency by method (in milliseconds)
    pub static ref RPC_LATENCY: HistogramVec = register_histogram_vec!(
        "loopd_rpc_latency_ms",
        "RPC call latency in milliseconds",
        &["method"],
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    /// Calls rejected by access control, by method
    pub static ref AUTH_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "loopd_auth_rejections_total",
        "Calls rejected by access control",
        &["method"]
    )
    .unwrap();

    // ═══════════════════════════════════════════════════════════════════════════
    // DAEMON METRICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Running background tasks by name
    pub static ref BACKGROUND_TASKS: IntGaugeVec = register_int_gauge_vec!(
        "loopd_background_tasks",
        "Running background tasks",
        &["task"]
    )
    .unwrap();

    /// Fatal runtime errors by task
    pub static ref RUNTIME_FAILURES: IntCounterVec = register_int_counter_vec!(
        "loopd_runtime_failures_total",
        "Background task failures that triggered shutdown",
        &["task"]
    )
    .unwrap();

    /// ERROR level log events
    pub static ref ERRORS_LOGGED: IntCounterVec = register_int_counter_vec!(
        "loopd_errors_logged_total",
        "ERROR level log events by target",
        &["target"]
    )
    .unwrap();
}
