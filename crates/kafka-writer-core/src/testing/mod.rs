//! Test utilities for the Kafka writer.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockCluster`] - An in-memory [`Dialer`](crate::broker::Dialer) with failure injection
//! - [`MockBroker`] - A lightweight TCP broker speaking Metadata and Produce
//! - [`WriterTestHarness`] - A mock cluster plus a fast writer configuration
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_writer_core::testing::{messages, TestHarnessBuilder};
//!
//! #[tokio::test]
//! async fn test_batching() {
//!     let harness = TestHarnessBuilder::new().batch_size(2).build();
//!     let writer = harness.writer().unwrap();
//!
//!     writer.write_messages(None, messages(&["a", "b"])).await.unwrap();
//!     assert_eq!(harness.cluster.write_calls().len(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_broker;
pub mod mock_cluster;

pub use harness::{messages, TestHarnessBuilder, WriterTestHarness, TEST_TOPIC};
pub use mock_broker::{api_keys, responses, BrokerCall, MockBroker, ResponseGenerator};
pub use mock_cluster::{MockCluster, MockConnection, WriteCall, MOCK_BROKER, REQUEST_TIMED_OUT};
