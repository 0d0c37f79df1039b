//! Kafka Writer Core Library
//!
//! A batching producer for a single Kafka topic. Messages are routed to
//! partitions by a pluggable [`Balancer`], buffered per partition, and
//! flushed in batches bounded by message count, byte size and time.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`writer`] - The public [`Writer`] and its per-partition workers
//! - [`balancer`] - Partition selection strategies
//! - [`broker`] - Dialer abstraction and the Kafka wire implementation
//! - [`message`] - Messages and their batching size
//! - [`stats`] - Lock-free writer statistics
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`metrics`] - Prometheus export of writer statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_writer_core::{Message, Writer, WriterConfig};
//!
//! let config = WriterConfig::new(vec!["localhost:9092".to_string()], "events");
//! let writer = Writer::new(config)?;
//!
//! writer
//!     .write_messages(None, vec![Message::new("Hello World!").with_key("greeting")])
//!     .await?;
//! writer.close().await?;
//! ```

#![forbid(unsafe_code)]

pub mod balancer;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod stats;
pub mod writer;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use balancer::{Balancer, BalancerKind, Hash, RoundRobin};
pub use broker::{Dialer, KafkaDialer, PartitionConnection};
pub use config::{AppConfig, RetryPolicy, WriterConfig};
pub use error::{ConfigError, Result, WriterError};
pub use message::Message;
pub use metrics::WriterMetrics;
pub use stats::WriterStats;
pub use writer::Writer;
