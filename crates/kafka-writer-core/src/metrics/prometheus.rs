//! Prometheus metrics for the Kafka writer.
//!
//! The writer itself only keeps lock-free [`WriterStats`] counters.
//! [`WriterMetrics::observe`] mirrors a snapshot into a Prometheus registry
//! so it can be scraped.

use prometheus::{GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::stats::{HistogramSnapshot, WriterStats};

/// Writer metrics collection, labelled by topic.
pub struct WriterMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Successful batch flushes.
    pub writes_total: IntCounterVec,

    /// Messages delivered.
    pub messages_total: IntCounterVec,

    /// Bytes delivered.
    pub bytes_total: IntCounterVec,

    /// Messages that failed terminally.
    pub errors_total: IntCounterVec,

    /// Connection dials.
    pub dials_total: IntCounterVec,

    /// Partition rebalances.
    pub rebalances_total: IntCounterVec,

    /// Largest retry count of a single flush.
    pub retries_max: IntGaugeVec,

    /// Average retry count per flush.
    pub retries_avg: GaugeVec,

    /// Average messages per flush.
    pub batch_size_avg: GaugeVec,

    /// Average flush latency in seconds.
    pub write_seconds_avg: GaugeVec,
}

impl WriterMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            let metric = IntCounterVec::new(Opts::new(name, help), &["topic"])
                .expect("metric creation should succeed");
            registry
                .register(Box::new(metric.clone()))
                .expect("metric registration should succeed");
            metric
        };

        let writes_total = counter("kafka_writer_writes_total", "Total successful batch flushes");
        let messages_total =
            counter("kafka_writer_messages_total", "Total messages delivered");
        let bytes_total = counter("kafka_writer_bytes_total", "Total bytes delivered");
        let errors_total = counter(
            "kafka_writer_errors_total",
            "Total messages that failed terminally",
        );
        let dials_total = counter("kafka_writer_dials_total", "Total connection dials");
        let rebalances_total =
            counter("kafka_writer_rebalances_total", "Total partition rebalances");

        let retries_max = IntGaugeVec::new(
            Opts::new(
                "kafka_writer_retries_max",
                "Largest number of retries consumed by a single flush",
            ),
            &["topic"],
        )
        .expect("metric creation should succeed");

        let gauge = |name: &str, help: &str| {
            let metric = GaugeVec::new(Opts::new(name, help), &["topic"])
                .expect("metric creation should succeed");
            registry
                .register(Box::new(metric.clone()))
                .expect("metric registration should succeed");
            metric
        };

        let retries_avg = gauge(
            "kafka_writer_retries_avg",
            "Average number of retries consumed per flush",
        );
        let batch_size_avg = gauge(
            "kafka_writer_batch_size_avg",
            "Average number of messages per flush",
        );
        let write_seconds_avg = gauge(
            "kafka_writer_write_seconds_avg",
            "Average flush latency in seconds",
        );

        registry
            .register(Box::new(retries_max.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            writes_total,
            messages_total,
            bytes_total,
            errors_total,
            dials_total,
            rebalances_total,
            retries_max,
            retries_avg,
            batch_size_avg,
            write_seconds_avg,
        }
    }

    /// Mirror a stats snapshot into the registry.
    ///
    /// Counters only move forward, so snapshots may be observed at any rate.
    pub fn observe(&self, stats: &WriterStats) {
        let topic = [stats.topic.as_str()];

        advance(&self.writes_total, &topic, stats.writes);
        advance(&self.messages_total, &topic, stats.messages);
        advance(&self.bytes_total, &topic, stats.bytes);
        advance(&self.errors_total, &topic, stats.errors);
        advance(&self.dials_total, &topic, stats.dials);
        advance(&self.rebalances_total, &topic, stats.rebalances);

        self.retries_max
            .with_label_values(&topic)
            .set(stats.retries.max as i64);
        self.retries_avg
            .with_label_values(&topic)
            .set(stats.retries.avg);
        self.batch_size_avg
            .with_label_values(&topic)
            .set(stats.batch_size.avg);
        self.write_seconds_avg
            .with_label_values(&topic)
            .set(micros_to_seconds(&stats.write_time_us));
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for WriterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(counter: &IntCounterVec, labels: &[&str], total: u64) {
    let counter = counter.with_label_values(labels);
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn micros_to_seconds(histogram: &HistogramSnapshot) -> f64 {
    histogram.avg / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(writes: u64, errors: u64) -> WriterStats {
        WriterStats {
            topic: "events".to_string(),
            writes,
            messages: writes * 2,
            bytes: writes * 48,
            errors,
            ..WriterStats::default()
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = WriterMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_observe_exports_counters() {
        let metrics = WriterMetrics::new();
        metrics.observe(&stats(3, 1));

        let output = metrics.encode().unwrap();
        assert!(output.contains("kafka_writer_writes_total{topic=\"events\"} 3"));
        assert!(output.contains("kafka_writer_errors_total{topic=\"events\"} 1"));
        assert!(output.contains("kafka_writer_retries_max"));
    }

    #[test]
    fn test_observe_is_idempotent_per_snapshot() {
        let metrics = WriterMetrics::new();
        metrics.observe(&stats(3, 0));
        metrics.observe(&stats(3, 0));
        metrics.observe(&stats(5, 0));

        let writes = metrics.writes_total.with_label_values(&["events"]).get();
        assert_eq!(writes, 5);
    }
}
