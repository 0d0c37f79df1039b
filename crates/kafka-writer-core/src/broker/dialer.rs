//! Connection seams used by the partition writers.
//!
//! The writer never talks to the network directly. It asks a [`Dialer`] for
//! the partitions of its topic and for a [`PartitionConnection`] to each
//! partition leader. [`super::KafkaDialer`] is the default implementation.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// An open connection able to append batches to one partition.
#[async_trait]
pub trait PartitionConnection: Send + fmt::Debug {
    /// Append `messages` to the partition, in order.
    ///
    /// Returns the offset assigned to the first message.
    async fn write_messages(&mut self, messages: &[Message]) -> Result<i64>;

    /// Release the connection.
    async fn close(&mut self) {}
}

/// Establishes partition connections and discovers partitions.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Connect to the leader of `partition` through one of `brokers`.
    async fn dial_leader(
        &self,
        brokers: &[String],
        topic: &str,
        partition: i32,
    ) -> Result<Box<dyn PartitionConnection>>;

    /// List the partition IDs of `topic` in ascending order.
    async fn lookup_partitions(&self, brokers: &[String], topic: &str) -> Result<Vec<i32>>;
}
