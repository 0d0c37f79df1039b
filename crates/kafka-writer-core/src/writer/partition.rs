//! Per-partition batching and retry worker.
//!
//! Each partition of the topic is served by one [`PartitionWriter`] task. The
//! task owns its intake queue, the batch under construction, the flush timer
//! and the connection to the partition leader. Envelopes are processed in
//! arrival order and at most one flush runs at a time, so messages reach the
//! partition in the order they were accepted.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::broker::{Dialer, PartitionConnection};
use crate::config::{RetryPolicy, WriterConfig};
use crate::error::{Result, WriterError};
use crate::message::Message;
use crate::stats::StatsRegistry;

use super::batch::{Batch, DeliveryOutcome, Envelope};

/// State shared by every partition writer of one writer.
#[derive(Debug, Clone)]
pub(crate) struct PartitionContext {
    pub(crate) config: Arc<WriterConfig>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) brokers: Arc<RwLock<Vec<String>>>,
    pub(crate) stats: Arc<StatsRegistry>,
}

/// Handle to a running partition writer.
#[derive(Debug)]
pub(crate) struct PartitionHandle {
    pub(crate) sender: mpsc::Sender<Envelope>,
    pub(crate) task: JoinHandle<()>,
}

impl PartitionHandle {
    /// Stop accepting envelopes and wait until the buffered ones are resolved.
    pub(crate) async fn shutdown(self, partition: i32) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            warn!(partition, error = %e, "partition writer task failed");
        }
    }
}

pub(crate) struct PartitionWriter {
    partition: i32,
    ctx: PartitionContext,
    conn: Option<Box<dyn PartitionConnection>>,
    batch: Batch,
    flush_at: Option<tokio::time::Instant>,
}

impl PartitionWriter {
    /// Start the writer for `partition` on the current runtime.
    pub(crate) fn spawn(partition: i32, ctx: PartitionContext) -> PartitionHandle {
        let (sender, receiver) = mpsc::channel(ctx.config.queue_capacity());
        let writer = Self {
            partition,
            ctx,
            conn: None,
            batch: Batch::default(),
            flush_at: None,
        };
        let task = tokio::spawn(writer.run(receiver));
        PartitionHandle { sender, task }
    }

    /// Process envelopes until every sender is dropped, then flush what is left.
    async fn run(mut self, mut intake: mpsc::Receiver<Envelope>) {
        debug!(partition = self.partition, "partition writer started");

        loop {
            let flush_at = self.flush_at;
            let timer = async move {
                match flush_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                envelope = intake.recv() => match envelope {
                    Some(envelope) => self.accept(envelope).await,
                    None => break,
                },
                () = timer => {
                    debug!(partition = self.partition, "batch timeout reached");
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        info!(partition = self.partition, "partition writer stopped");
    }

    /// Add one envelope to the batch, flushing before or after as the limits require.
    async fn accept(&mut self, envelope: Envelope) {
        let config = Arc::clone(&self.ctx.config);
        let size = envelope.message.size();

        if size > config.batch_bytes {
            warn!(
                partition = self.partition,
                size,
                max = config.batch_bytes,
                "discarding message larger than batch_bytes"
            );
            self.ctx.stats.record_errors(1);
            envelope.resolve(DeliveryOutcome::Discarded(WriterError::OversizeMessage {
                size,
                max: config.batch_bytes,
            }));
            return;
        }

        if !self.batch.is_empty() && self.batch.bytes() + size > config.batch_bytes {
            self.flush().await;
        }

        if self.batch.is_empty() {
            self.flush_at = Some(tokio::time::Instant::now() + config.batch_timeout());
        }
        self.batch.push(envelope);

        if self.batch.len() >= config.batch_size || self.batch.bytes() >= config.batch_bytes {
            self.flush().await;
        }
    }

    /// Deliver the current batch and resolve all of its envelopes.
    async fn flush(&mut self) {
        self.flush_at = None;
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let count = batch.len() as u64;
        let bytes = batch.bytes();
        let messages = batch.messages();
        let started = Instant::now();

        match self.deliver(&messages).await {
            Ok(base_offset) => {
                let elapsed = started.elapsed();
                debug!(
                    partition = self.partition,
                    count,
                    bytes,
                    base_offset,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch written"
                );
                self.ctx
                    .stats
                    .record_write(count, bytes, elapsed.as_micros() as u64);
                batch.resolve_all(|| DeliveryOutcome::Delivered);
            }
            Err(cause) => {
                warn!(
                    partition = self.partition,
                    count,
                    error = %cause,
                    "batch failed after exhausting retries"
                );
                self.ctx.stats.record_errors(count);
                let partition = self.partition;
                let retries = self.ctx.config.retries;
                let cause = cause.to_string();
                batch.resolve_all(|| {
                    DeliveryOutcome::Failed(WriterError::DeliveryExhausted {
                        partition,
                        retries,
                        cause: cause.clone(),
                    })
                });
            }
        }
    }

    /// Write `messages`, retrying up to `retries` times.
    async fn deliver(&mut self, messages: &[Message]) -> Result<i64> {
        let retries = self.ctx.config.retries;
        let mut retry = 0u32;

        loop {
            match self.attempt(messages).await {
                Ok(offset) => {
                    self.ctx.stats.record_retries(u64::from(retry));
                    return Ok(offset);
                }
                Err(e) => {
                    if e.is_connection_error() || self.ctx.config.retry_policy == RetryPolicy::Redial
                    {
                        if let Some(mut conn) = self.conn.take() {
                            conn.close().await;
                        }
                    }

                    if retry >= retries {
                        self.ctx.stats.record_retries(u64::from(retry));
                        return Err(e);
                    }

                    retry += 1;
                    let backoff = self.backoff(retry);
                    warn!(
                        partition = self.partition,
                        retry,
                        retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "write failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    /// One write, dialing first when no connection is held.
    async fn attempt(&mut self, messages: &[Message]) -> Result<i64> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => Self::dial(&self.ctx, self.partition).await?,
        };

        let write_timeout = self.ctx.config.write_timeout();
        let result = match timeout(write_timeout, conn.write_messages(messages)).await {
            Ok(result) => result,
            Err(_) => Err(WriterError::WriteTimeout(write_timeout)),
        };
        self.conn = Some(conn);
        result
    }

    /// Connect to the partition leader, making at most `max_attempts` dials.
    async fn dial(ctx: &PartitionContext, partition: i32) -> Result<Box<dyn PartitionConnection>> {
        let brokers = ctx.brokers.read().await.clone();
        let max_attempts = ctx.config.max_attempts;
        let topic = &ctx.config.topic;
        let mut last_error = WriterError::NoBrokersAvailable;

        for attempt in 1..=max_attempts {
            ctx.stats.record_dial();
            match ctx.dialer.dial_leader(&brokers, topic, partition).await {
                Ok(conn) => {
                    debug!(partition, attempt, "dialed partition leader");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(
                        partition,
                        attempt,
                        max_attempts,
                        error = %e,
                        "dial failed"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Capped exponential backoff with up to 10% jitter.
    fn backoff(&self, retry: u32) -> std::time::Duration {
        let base = self.ctx.config.retry_backoff(retry);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
