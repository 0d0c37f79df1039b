//! Test harness for writer integration tests.
//!
//! Provides a complete test environment with:
//! - An in-memory [`MockCluster`] hosting the test topic
//! - A writer configuration tuned for fast tests
//! - Helpers for building writers and reading back what they wrote

use crate::config::WriterConfig;
use crate::error::Result;
use crate::message::Message;
use crate::writer::Writer;

use super::mock_cluster::MockCluster;

/// Topic hosted by a default harness.
pub const TEST_TOPIC: &str = "test-topic";

/// Test harness for integration testing.
pub struct WriterTestHarness {
    /// The in-memory cluster
    pub cluster: MockCluster,
    /// Configuration used by [`WriterTestHarness::writer`]
    pub config: WriterConfig,
}

impl WriterTestHarness {
    /// Create a harness hosting [`TEST_TOPIC`] with a single partition.
    #[must_use]
    pub fn new() -> Self {
        TestHarnessBuilder::new().build()
    }

    /// Create a writer over the harness cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the harness configuration is invalid.
    pub fn writer(&self) -> Result<Writer> {
        Writer::new(self.config.clone().with_dialer(self.cluster.dialer()))
    }

    /// Create a writer after adjusting the harness configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the adjusted configuration is invalid.
    pub fn writer_with(&self, adjust: impl FnOnce(&mut WriterConfig)) -> Result<Writer> {
        let mut config = self.config.clone();
        adjust(&mut config);
        Writer::new(config.with_dialer(self.cluster.dialer()))
    }

    /// Values written to `partition`, starting at `offset`.
    #[must_use]
    pub fn read_values(&self, partition: i32, offset: i64) -> Vec<String> {
        self.cluster
            .read_partition(partition, offset)
            .iter()
            .map(|m| String::from_utf8_lossy(&m.value).into_owned())
            .collect()
    }
}

impl Default for WriterTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build keyless messages from string values.
#[must_use]
pub fn messages(values: &[&str]) -> Vec<Message> {
    values
        .iter()
        .map(|v| Message::new(v.as_bytes().to_vec()))
        .collect()
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    topic: String,
    partitions: i32,
    batch_size: usize,
    batch_bytes: u64,
    batch_timeout_ms: u64,
    retries: u32,
    rebalance_interval_ms: u64,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topic: TEST_TOPIC.to_string(),
            partitions: 1,
            batch_size: 100,
            batch_bytes: 1_048_576,
            batch_timeout_ms: 50,
            retries: 3,
            rebalance_interval_ms: 0,
        }
    }

    /// Set the hosted topic.
    #[must_use]
    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = topic.to_string();
        self
    }

    /// Set the number of partitions.
    #[must_use]
    pub fn partitions(mut self, count: i32) -> Self {
        self.partitions = count;
        self
    }

    /// Set the batch message limit.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the batch byte limit.
    #[must_use]
    pub fn batch_bytes(mut self, bytes: u64) -> Self {
        self.batch_bytes = bytes;
        self
    }

    /// Set the batch timeout.
    #[must_use]
    pub fn batch_timeout_ms(mut self, ms: u64) -> Self {
        self.batch_timeout_ms = ms;
        self
    }

    /// Set the number of retries per flush.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the rebalance interval; 0 disables rebalancing.
    #[must_use]
    pub fn rebalance_interval_ms(mut self, ms: u64) -> Self {
        self.rebalance_interval_ms = ms;
        self
    }

    /// Build the test harness.
    #[must_use]
    pub fn build(self) -> WriterTestHarness {
        let cluster = MockCluster::new(&self.topic, self.partitions);

        let mut config = WriterConfig::new(cluster.brokers(), self.topic);
        config.batch_size = self.batch_size;
        config.batch_bytes = self.batch_bytes;
        config.batch_timeout_ms = self.batch_timeout_ms;
        config.retries = self.retries;
        config.rebalance_interval_ms = self.rebalance_interval_ms;
        config.retry_backoff_ms = 1;
        config.retry_backoff_max_ms = 5;
        config.write_timeout_ms = 1_000;

        WriterTestHarness { cluster, config }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
