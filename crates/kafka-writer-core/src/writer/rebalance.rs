//! Background partition discovery.
//!
//! Periodically looks up the topic's partitions so that partitions added to
//! the topic start receiving messages without restarting the writer.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::WriterInner;

/// Background task that periodically refreshes the partition set of a writer.
pub(super) struct Rebalancer {
    writer: Weak<WriterInner>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Rebalancer {
    pub(super) fn new(
        writer: Weak<WriterInner>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            writer,
            interval,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signalled or the writer is dropped.
    pub(super) async fn run(mut self) {
        if self.interval.is_zero() || *self.shutdown_rx.borrow() {
            return;
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "starting partition rebalancer"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Partitions were just discovered by the first write
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(writer) = self.writer.upgrade() else {
                        break;
                    };
                    match writer.rebalance().await {
                        Ok(added) => debug!(added, "rebalance complete"),
                        Err(e) => warn!(error = %e, "rebalance failed"),
                    }
                }
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("partition rebalancer stopped");
    }
}
