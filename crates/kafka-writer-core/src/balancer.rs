//! Partition assignment strategies.
//!
//! A [`Balancer`] picks the partition that receives each message. The writer
//! always calls it with the current, non-empty, ascending list of partitions
//! known for the topic.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use murmur2::{murmur2, KAFKA_SEED};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Strategy selecting which partition receives a message.
///
/// Implementations are shared between every caller of the writer and must
/// tolerate concurrent calls.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Return one partition ID taken from `partitions`.
    ///
    /// `partitions` is never empty.
    fn assign(&self, message: &Message, partitions: &[i32]) -> i32;
}

/// Distributes messages evenly by cycling through the partitions.
///
/// The message content is ignored. Over a stable partition set of size N,
/// N consecutive calls visit every partition once, in ascending order,
/// starting with the first.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create a balancer whose first pick is the first partition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn assign(&self, _message: &Message, partitions: &[i32]) -> i32 {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed);
        partitions[next % partitions.len()]
    }
}

/// Routes keyed messages with Kafka's murmur2 partitioner.
///
/// Messages sharing a key land on the same partition as long as the
/// partition count does not change. Keyless messages fall back to
/// round-robin.
#[derive(Debug, Default)]
pub struct Hash {
    fallback: RoundRobin,
}

impl Hash {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for Hash {
    fn assign(&self, message: &Message, partitions: &[i32]) -> i32 {
        match &message.key {
            Some(key) => {
                // Same as Kafka's toPositive(murmur2(key)) % numPartitions.
                let hash = murmur2(key, KAFKA_SEED) & 0x7fff_ffff;
                partitions[hash as usize % partitions.len()]
            }
            None => self.fallback.assign(message, partitions),
        }
    }
}

/// Built-in balancers selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// [`RoundRobin`].
    #[default]
    RoundRobin,
    /// [`Hash`].
    Hash,
}

impl BalancerKind {
    /// Instantiate the selected balancer.
    #[must_use]
    pub fn build(self) -> Arc<dyn Balancer> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin::new()),
            Self::Hash => Arc::new(Hash::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_in_order() {
        let balancer = RoundRobin::new();
        let partitions = [0, 1, 2];
        let msg = Message::new("x");

        let picks: Vec<i32> = (0..6).map(|_| balancer.assign(&msg, &partitions)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_adapts_to_partition_growth() {
        let balancer = RoundRobin::new();
        let msg = Message::new("x");

        assert_eq!(balancer.assign(&msg, &[0, 1]), 0);
        assert_eq!(balancer.assign(&msg, &[0, 1]), 1);
        // Cursor is wrapped against the set passed on each call.
        assert_eq!(balancer.assign(&msg, &[0, 1, 2]), 2);
        assert_eq!(balancer.assign(&msg, &[0, 1, 2]), 0);
    }

    #[test]
    fn test_hash_is_stable_per_key() {
        let balancer = Hash::new();
        let partitions: Vec<i32> = (0..12).collect();
        let msg = Message::new("v").with_key("user-42");

        let first = balancer.assign(&msg, &partitions);
        for _ in 0..10 {
            assert_eq!(balancer.assign(&msg, &partitions), first);
        }
    }

    #[test]
    fn test_hash_keyless_falls_back_to_round_robin() {
        let balancer = Hash::new();
        let msg = Message::new("v");
        let picks: Vec<i32> = (0..4).map(|_| balancer.assign(&msg, &[5, 6])).collect();
        assert_eq!(picks, vec![5, 6, 5, 6]);
    }

    #[test]
    fn test_balancer_kind_build() {
        let balancer = BalancerKind::RoundRobin.build();
        assert_eq!(balancer.assign(&Message::new("x"), &[7]), 7);

        let kind: BalancerKind = serde_yaml::from_str("hash").unwrap();
        assert_eq!(kind, BalancerKind::Hash);
    }
}
