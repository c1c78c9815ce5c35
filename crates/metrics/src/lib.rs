//! Metrics and logging for the loop swap daemon
//!
//! # Features
//!
//! - Prometheus metrics for swaps, subscribers, RPC calls and access control
//! - Subscriber initialization with env filter and optional JSON output
//! - Correlation IDs for RPC calls
//!
//! # Example
//!
//! ```no_run
//! use loopd_metrics::{init_tracing, MetricsCollector};
//!
//! let collector = MetricsCollector::new();
//! init_tracing("info", false, collector).unwrap();
//! collector.set_swaps_tracked(0);
//! println!("{}", collector.export_metrics().unwrap());
//! ```

pub mod collector;
pub mod metrics;
pub mod tracing;

pub use collector::{MetricsCollector, MetricsError};
pub use self::tracing::{init_tracing, rpc_span, CorrelationId, MetricsLayer, TracingError};
