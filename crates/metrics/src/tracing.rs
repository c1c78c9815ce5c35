use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::collector::MetricsCollector;

/// Initialize the global subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str, json: bool, collector: MetricsCollector) -> Result<(), TracingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| TracingError::InitError(e.to_string()))?;

    let (json_layer, plain_layer) = if json {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .json();
        (Some(layer), None)
    } else {
        (None, Some(fmt::layer().with_target(true).with_level(true)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(plain_layer)
        .with(MetricsLayer::new(collector))
        .try_init()
        .map_err(|e| TracingError::InitError(e.to_string()))?;

    Ok(())
}

/// Tracing layer that counts ERROR events per target
pub struct MetricsLayer {
    collector: MetricsCollector,
}

impl MetricsLayer {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() == Level::ERROR {
            self.collector.record_error_logged(metadata.target());
        }
    }
}

/// Correlation ID for tracking a call across the gateway and RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Span for a single RPC call
pub fn rpc_span(method: &str, correlation_id: CorrelationId) -> tracing::Span {
    tracing::info_span!(
        "rpc",
        method = %method,
        correlation_id = %correlation_id,
    )
}

/// Tracing error types
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("tracing initialization error: {0}")]
    InitError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ERRORS_LOGGED;

    #[test]
    fn test_correlation_id_generation() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_metrics_layer_counts_errors() {
        let subscriber =
            tracing_subscriber::registry().with(MetricsLayer::new(MetricsCollector::new()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "loopd_metrics_layer_test", "boom");
            tracing::warn!(target: "loopd_metrics_layer_test", "not counted");
        });

        assert_eq!(
            ERRORS_LOGGED
                .with_label_values(&["loopd_metrics_layer_test"])
                .get(),
            1
        );
    }
}
