//! In-memory cluster for testing writers without a network.
//!
//! [`MockCluster`] implements [`Dialer`] over per-partition logs held in
//! memory. Failures are injected per broker address (unreachable brokers) or
//! per write (slow writes, rejected writes, writes failing with a message).

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{Dialer, PartitionConnection};
use crate::error::{Result, WriterError};
use crate::message::Message;

/// Address of the single reachable broker of a fresh cluster.
pub const MOCK_BROKER: &str = "mock-broker:9092";

/// Error code returned by writes failed with [`MockCluster::fail_next_writes`].
pub const REQUEST_TIMED_OUT: i16 = 7;

/// One recorded write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub partition: i32,
    pub count: usize,
    pub base_offset: i64,
}

#[derive(Debug, Default)]
struct ClusterState {
    topic: String,
    logs: Mutex<BTreeMap<i32, Vec<Message>>>,
    unreachable: Mutex<HashSet<String>>,
    write_failure: Mutex<Option<String>>,
    write_delay: Mutex<Duration>,
    fail_next: AtomicU32,
    lookups: AtomicU64,
    calls: Mutex<Vec<WriteCall>>,
}

/// In-memory topic with a configurable number of partitions.
#[derive(Debug, Clone)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    /// Create a cluster hosting `topic` with partitions `0..partitions`.
    #[must_use]
    pub fn new(topic: &str, partitions: i32) -> Self {
        let logs = (0..partitions).map(|p| (p, Vec::new())).collect();
        Self {
            state: Arc::new(ClusterState {
                topic: topic.to_string(),
                logs: Mutex::new(logs),
                ..ClusterState::default()
            }),
        }
    }

    /// Broker list reaching this cluster.
    #[must_use]
    pub fn brokers(&self) -> Vec<String> {
        vec![MOCK_BROKER.to_string()]
    }

    /// This cluster as a shareable dialer.
    #[must_use]
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    /// Make dials through `address` fail, or succeed again.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = self.state.unreachable.lock().unwrap();
        if unreachable {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    /// Fail every write with `message` until cleared with `None`.
    pub fn fail_writes(&self, message: Option<&str>) {
        *self.state.write_failure.lock().unwrap() = message.map(str::to_string);
    }

    /// Reject the next `count` writes with [`REQUEST_TIMED_OUT`].
    pub fn fail_next_writes(&self, count: u32) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.state.write_delay.lock().unwrap() = delay;
    }

    /// Grow the topic to `partitions` partitions.
    pub fn set_partition_count(&self, partitions: i32) {
        let mut logs = self.state.logs.lock().unwrap();
        for p in 0..partitions {
            logs.entry(p).or_default();
        }
    }

    /// Messages of `partition` starting at `offset`.
    #[must_use]
    pub fn read_partition(&self, partition: i32, offset: i64) -> Vec<Message> {
        let logs = self.state.logs.lock().unwrap();
        logs.get(&partition)
            .map(|log| log.iter().skip(offset.max(0) as usize).cloned().collect())
            .unwrap_or_default()
    }

    /// Offset the next message written to `partition` will get.
    #[must_use]
    pub fn end_offset(&self, partition: i32) -> i64 {
        let logs = self.state.logs.lock().unwrap();
        logs.get(&partition).map_or(0, |log| log.len() as i64)
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn write_calls(&self) -> Vec<WriteCall> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Successful writes to `partition`.
    #[must_use]
    pub fn write_count(&self, partition: i32) -> usize {
        self.write_calls()
            .iter()
            .filter(|c| c.partition == partition)
            .count()
    }

    /// Number of partition lookups served.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.state.lookups.load(Ordering::SeqCst)
    }

    /// First reachable broker of `brokers`.
    fn reachable(&self, brokers: &[String]) -> Result<String> {
        let unreachable = self.state.unreachable.lock().unwrap();
        let mut last = None;
        for broker in brokers {
            if unreachable.contains(broker) {
                last = Some(broker.clone());
            } else {
                return Ok(broker.clone());
            }
        }
        match last {
            Some(address) => Err(WriterError::BrokerUnavailable {
                address,
                message: "connection refused".to_string(),
            }),
            None => Err(WriterError::NoBrokersAvailable),
        }
    }

    fn check_topic(&self, topic: &str) -> Result<()> {
        if topic == self.state.topic {
            Ok(())
        } else {
            Err(WriterError::TopicNotFound {
                topic: topic.to_string(),
            })
        }
    }
}

#[async_trait]
impl Dialer for MockCluster {
    async fn dial_leader(
        &self,
        brokers: &[String],
        topic: &str,
        partition: i32,
    ) -> Result<Box<dyn PartitionConnection>> {
        let broker = self.reachable(brokers)?;
        self.check_topic(topic)?;
        if !self.state.logs.lock().unwrap().contains_key(&partition) {
            return Err(WriterError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            broker,
            partition,
        }))
    }

    async fn lookup_partitions(&self, brokers: &[String], topic: &str) -> Result<Vec<i32>> {
        self.reachable(brokers)?;
        self.check_topic(topic)?;
        self.state.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.logs.lock().unwrap().keys().copied().collect())
    }
}

/// Connection to one partition of a [`MockCluster`].
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<ClusterState>,
    broker: String,
    partition: i32,
}

#[async_trait]
impl PartitionConnection for MockConnection {
    async fn write_messages(&mut self, messages: &[Message]) -> Result<i64> {
        let delay = *self.state.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let pending = self.state.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.state.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(WriterError::BrokerRejected {
                partition: self.partition,
                error_code: REQUEST_TIMED_OUT,
            });
        }

        if let Some(message) = self.state.write_failure.lock().unwrap().clone() {
            return Err(WriterError::BrokerUnavailable {
                address: self.broker.clone(),
                message,
            });
        }

        let mut logs = self.state.logs.lock().unwrap();
        let log = logs.entry(self.partition).or_default();
        let base_offset = log.len() as i64;
        log.extend_from_slice(messages);
        self.state.calls.lock().unwrap().push(WriteCall {
            partition: self.partition,
            count: messages.len(),
            base_offset,
        });
        Ok(base_offset)
    }
}
