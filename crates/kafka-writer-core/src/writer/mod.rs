//! The public writer.
//!
//! A [`Writer`] routes every message through its balancer to a per-partition
//! worker, waits for each message's outcome and aggregates statistics.
//!
//! Partition workers are spawned the first time a partition receives a
//! message, or when a rebalance discovers a new partition. They live until
//! [`Writer::close`].

mod batch;
mod partition;
mod rebalance;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::balancer::Balancer;
use crate::broker::Dialer;
use crate::config::WriterConfig;
use crate::error::{Result, WriterError};
use crate::message::Message;
use crate::stats::{StatsRegistry, WriterStats};

use self::batch::{DeliveryOutcome, Envelope};
use self::partition::{PartitionContext, PartitionHandle, PartitionWriter};
use self::rebalance::Rebalancer;

/// Batching producer for a single topic.
///
/// `Writer` is cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Writer {
    inner: Arc<WriterInner>,
}

#[derive(Debug)]
struct WriterInner {
    topic: String,
    balancer: Arc<dyn Balancer>,
    ctx: PartitionContext,
    /// Known partitions, ascending.
    partitions: RwLock<Vec<i32>>,
    writers: DashMap<i32, PartitionHandle>,
    /// Held shared while spawning a partition writer, exclusively by `close`
    /// before it collects the writers.
    spawn_gate: RwLock<()>,
    started: OnceCell<()>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    rebalancer: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Create a writer. No connection is made until the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WriterConfig) -> Result<Self> {
        config.validate()?;

        let balancer = config.resolve_balancer();
        let dialer = config.resolve_dialer();
        let brokers = config.broker_addresses();
        let topic = config.topic.clone();
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = PartitionContext {
            config: Arc::new(config),
            dialer,
            brokers: Arc::new(RwLock::new(brokers)),
            stats: Arc::new(StatsRegistry::new()),
        };

        Ok(Self {
            inner: Arc::new(WriterInner {
                topic,
                balancer,
                ctx,
                partitions: RwLock::new(Vec::new()),
                writers: DashMap::new(),
                spawn_gate: RwLock::new(()),
                started: OnceCell::new(),
                closed: AtomicBool::new(false),
                shutdown_tx,
                rebalancer: Mutex::new(None),
            }),
        })
    }

    /// Topic this writer produces to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Write `messages` and wait for all of them to resolve.
    ///
    /// Each message goes to its explicit partition when set, otherwise to the
    /// partition picked by the balancer. The call returns once every message
    /// has been delivered or has failed, or once `deadline` passes. Messages
    /// already handed to a partition keep being processed after the deadline.
    ///
    /// Messages larger than `batch_bytes` are dropped and only counted in
    /// [`WriterStats::errors`]; they do not make this call fail.
    ///
    /// # Errors
    ///
    /// - [`WriterError::WriterClosed`] once [`Writer::close`] has begun
    /// - [`WriterError::UnknownPartition`] if a message names a partition the
    ///   topic does not have; nothing is written in that case
    /// - [`WriterError::DeadlineExceeded`] if `deadline` passes first
    /// - the first per-message failure, usually
    ///   [`WriterError::DeliveryExhausted`]
    pub async fn write_messages<I>(&self, deadline: Option<Instant>, messages: I) -> Result<()>
    where
        I: IntoIterator<Item = Message>,
    {
        let work = self.dispatch_and_wait(messages.into_iter().collect());
        match deadline {
            Some(deadline) => timeout_at(deadline, work)
                .await
                .map_err(|_| WriterError::DeadlineExceeded)?,
            None => work.await,
        }
    }

    /// [`Writer::write_messages`] with a deadline `timeout` from now.
    ///
    /// # Errors
    ///
    /// See [`Writer::write_messages`].
    pub async fn write_messages_timeout<I>(&self, timeout: Duration, messages: I) -> Result<()>
    where
        I: IntoIterator<Item = Message>,
    {
        self.write_messages(Some(Instant::now() + timeout), messages)
            .await
    }

    async fn dispatch_and_wait(&self, messages: Vec<Message>) -> Result<()> {
        self.inner.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_started().await?;

        let routed = self.inner.route(messages).await?;

        let mut receivers = Vec::with_capacity(routed.len());
        for (partition, message) in routed {
            let sender = self.inner.sender(partition).await?;
            let (envelope, rx) = Envelope::new(message);
            sender
                .send(envelope)
                .await
                .map_err(|_| WriterError::WriterClosed)?;
            receivers.push(rx);
        }

        let mut first_error = None;
        for rx in receivers {
            let failure = match rx.await {
                Ok(DeliveryOutcome::Delivered) => None,
                Ok(DeliveryOutcome::Discarded(e)) => {
                    debug!(error = %e, "message discarded");
                    None
                }
                Ok(DeliveryOutcome::Failed(e)) => Some(e),
                Err(_) => Some(WriterError::WriterClosed),
            };
            if first_error.is_none() {
                first_error = failure;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Discover partitions and start the rebalancer on first use.
    async fn ensure_started(&self) -> Result<()> {
        self.inner
            .started
            .get_or_try_init(|| async {
                let partitions = self.inner.lookup_partitions().await?;
                info!(
                    topic = %self.inner.topic,
                    partitions = partitions.len(),
                    "discovered topic partitions"
                );
                *self.inner.partitions.write().await = partitions;
                self.start_rebalancer().await;
                Ok::<(), WriterError>(())
            })
            .await?;
        Ok(())
    }

    async fn start_rebalancer(&self) {
        let interval = self.inner.ctx.config.rebalance_interval();
        if interval.is_zero() {
            debug!("partition rebalancing disabled (interval=0)");
            return;
        }
        let rebalancer = Rebalancer::new(
            Arc::downgrade(&self.inner),
            interval,
            self.inner.shutdown_tx.subscribe(),
        );
        *self.inner.rebalancer.lock().await = Some(tokio::spawn(rebalancer.run()));
    }

    /// Stop the writer.
    ///
    /// New writes fail with [`WriterError::WriterClosed`]. Buffered messages
    /// are flushed and every in-flight flush is awaited before returning.
    /// Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; the signature leaves room for flush errors.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown_tx.send(true);

        if let Some(task) = self.inner.rebalancer.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "rebalancer task failed");
            }
        }

        // wait out spawns that passed the open check before `closed` was set
        drop(self.inner.spawn_gate.write().await);

        let partitions: Vec<i32> = self.inner.writers.iter().map(|e| *e.key()).collect();
        for partition in partitions {
            if let Some((_, handle)) = self.inner.writers.remove(&partition) {
                handle.shutdown(partition).await;
            }
        }

        info!(topic = %self.inner.topic, "writer closed");
        Ok(())
    }

    /// Point-in-time copy of the writer statistics.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.inner.ctx.stats.snapshot(&self.inner.topic)
    }

    /// Partitions currently known for the topic.
    pub async fn partitions(&self) -> Vec<i32> {
        self.inner.partitions.read().await.clone()
    }

    /// Replace the broker list used for future dials and lookups.
    ///
    /// Connections already established are kept.
    pub async fn set_brokers(&self, brokers: Vec<String>) {
        *self.inner.ctx.brokers.write().await = brokers;
    }

    /// Refresh the partition set now instead of waiting for the next interval.
    ///
    /// Returns the number of newly discovered partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer is closed or the lookup fails.
    pub async fn rebalance(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        self.ensure_started().await?;
        self.inner.rebalance().await
    }
}

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriterError::WriterClosed);
        }
        Ok(())
    }

    fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.ctx.dialer
    }

    /// Ask the dialer for the topic's partitions, making at most `max_attempts` tries.
    async fn lookup_partitions(&self) -> Result<Vec<i32>> {
        let brokers = self.ctx.brokers.read().await.clone();
        let max_attempts = self.ctx.config.max_attempts;
        let mut last_error = WriterError::NoBrokersAvailable;

        for attempt in 1..=max_attempts {
            match self.dialer().lookup_partitions(&brokers, &self.topic).await {
                Ok(mut partitions) if !partitions.is_empty() => {
                    partitions.sort_unstable();
                    partitions.dedup();
                    return Ok(partitions);
                }
                Ok(_) => {
                    last_error = WriterError::NoPartitions {
                        topic: self.topic.clone(),
                    };
                }
                Err(e) => {
                    debug!(attempt, max_attempts, error = %e, "partition lookup failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Assign every message to a partition before anything is sent.
    async fn route(&self, messages: Vec<Message>) -> Result<Vec<(i32, Message)>> {
        let partitions = self.partitions.read().await;
        if partitions.is_empty() {
            return Err(WriterError::NoPartitions {
                topic: self.topic.clone(),
            });
        }

        messages
            .into_iter()
            .map(|message| {
                let partition = match message.partition {
                    Some(p) if partitions.binary_search(&p).is_ok() => p,
                    Some(p) => {
                        return Err(WriterError::UnknownPartition {
                            topic: self.topic.clone(),
                            partition: p,
                        })
                    }
                    None => self.balancer.assign(&message, &partitions),
                };
                Ok((partition, message))
            })
            .collect()
    }

    /// Intake queue of `partition`, spawning its writer if needed.
    async fn sender(&self, partition: i32) -> Result<tokio::sync::mpsc::Sender<Envelope>> {
        self.ensure_open()?;
        if let Some(handle) = self.writers.get(&partition) {
            return Ok(handle.sender.clone());
        }
        let _gate = self.spawn_gate.read().await;
        self.ensure_open()?;
        let handle = self
            .writers
            .entry(partition)
            .or_insert_with(|| PartitionWriter::spawn(partition, self.ctx.clone()));
        Ok(handle.sender.clone())
    }

    /// Merge freshly discovered partitions into the known set.
    ///
    /// Partitions are only ever added; a writer is started for each new one.
    async fn rebalance(&self) -> Result<usize> {
        let discovered = self.lookup_partitions().await?;
        self.ctx.stats.record_rebalance();

        let added: Vec<i32> = {
            let mut known = self.partitions.write().await;
            let added: Vec<i32> = discovered
                .into_iter()
                .filter(|p| known.binary_search(p).is_err())
                .collect();
            known.extend(&added);
            known.sort_unstable();
            added
        };

        {
            let _gate = self.spawn_gate.read().await;
            if self.ensure_open().is_ok() {
                for &partition in &added {
                    self.writers
                        .entry(partition)
                        .or_insert_with(|| PartitionWriter::spawn(partition, self.ctx.clone()));
                }
            }
        }

        if !added.is_empty() {
            info!(topic = %self.topic, added = ?added, "discovered new partitions");
        }
        Ok(added.len())
    }
}

/// Stops the rebalancer of a writer dropped without `close`.
impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}
