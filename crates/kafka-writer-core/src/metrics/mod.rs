//! Metrics collection for the Kafka writer.
//!
//! Provides Prometheus-compatible metrics built from writer statistics.

pub mod prometheus;

pub use self::prometheus::WriterMetrics;
