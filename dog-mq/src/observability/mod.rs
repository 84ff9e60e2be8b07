pub mod metrics;
pub mod analytics;

#[cfg(feature = "tracing-basic")]
pub mod logging;

pub use metrics::{GlobalMetrics, LiveMetrics, MetricsCollector, MetricsSnapshot, PerformanceMetrics, QueueMetrics};
pub use analytics::{PerformanceAnalytics, ObservabilityLayer};

#[cfg(feature = "tracing-basic")]
pub use logging::{init_tracing, LogFormat};
