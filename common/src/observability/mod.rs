//! Observability utilities (metrics + tracing).

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig, ReceiverMetrics, SenderMetrics};
pub use tracing::init_tracing;
