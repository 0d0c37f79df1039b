//! Writer statistics.
//!
//! [`StatsRegistry`] is updated by the partition writers with plain atomics
//! and never blocks. [`StatsRegistry::snapshot`] copies the current values
//! into an immutable [`WriterStats`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free min/max/sum/count accumulator.
#[derive(Debug)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    /// Record one observation.
    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        // published last so a reader that sees the count also sees min/max
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Acquire);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        if count == 0 || min == u64::MAX {
            return HistogramSnapshot::default();
        }
        HistogramSnapshot {
            count,
            sum,
            min,
            max: self.max.load(Ordering::Relaxed),
            avg: sum as f64 / count as f64,
        }
    }
}

/// Point-in-time copy of a [`Histogram`]. All fields are zero when nothing
/// was observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

/// Counters shared by a writer and all of its partition writers.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    writes: AtomicU64,
    messages: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    dials: AtomicU64,
    rebalances: AtomicU64,
    retries: Histogram,
    batch_size: Histogram,
    write_time_us: Histogram,
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful flush of `messages` messages totalling `bytes`.
    pub fn record_write(&self, messages: u64, bytes: u64, elapsed_us: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(messages, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.batch_size.observe(messages);
        self.write_time_us.observe(elapsed_us);
    }

    /// Record `count` messages that reached a terminal failure.
    pub fn record_errors(&self, count: u64) {
        self.errors.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the number of retries one flush consumed.
    pub fn record_retries(&self, retries: u64) {
        self.retries.observe(retries);
    }

    pub fn record_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter into an immutable snapshot.
    #[must_use]
    pub fn snapshot(&self, topic: &str) -> WriterStats {
        WriterStats {
            topic: topic.to_string(),
            writes: self.writes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dials: self.dials.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            retries: self.retries.snapshot(),
            batch_size: self.batch_size.snapshot(),
            write_time_us: self.write_time_us.snapshot(),
        }
    }
}

/// Aggregate statistics of one writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriterStats {
    pub topic: String,
    /// Successful flushes.
    pub writes: u64,
    /// Messages delivered.
    pub messages: u64,
    /// Bytes delivered, overhead included.
    pub bytes: u64,
    /// Messages that failed terminally, oversize rejects included.
    pub errors: u64,
    pub dials: u64,
    pub rebalances: u64,
    /// Retries consumed per flush.
    pub retries: HistogramSnapshot,
    /// Messages per successful flush.
    pub batch_size: HistogramSnapshot,
    /// Latency of successful flushes in microseconds.
    pub write_time_us: HistogramSnapshot,
}
