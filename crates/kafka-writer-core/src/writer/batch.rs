//! Batch accumulation for a single partition.

use tokio::sync::oneshot;

use crate::error::WriterError;
use crate::message::Message;

/// Terminal outcome of one message.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    /// The message was appended to the partition.
    Delivered,
    /// The message was rejected before batching; only counted in stats.
    Discarded(WriterError),
    /// The message failed and the error is reported to the caller.
    Failed(WriterError),
}

/// A message plus the sink its outcome is sent through.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) message: Message,
    result: oneshot::Sender<DeliveryOutcome>,
}

impl Envelope {
    pub(crate) fn new(message: Message) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { message, result: tx }, rx)
    }

    /// Consume the envelope, so the outcome can only be sent once.
    pub(crate) fn resolve(self, outcome: DeliveryOutcome) {
        // The caller may have stopped waiting after its deadline.
        let _ = self.result.send(outcome);
    }
}

/// Envelopes buffered for the next flush, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    envelopes: Vec<Envelope>,
    bytes: u64,
}

impl Batch {
    pub(crate) fn push(&mut self, envelope: Envelope) {
        self.bytes += envelope.message.size();
        self.envelopes.push(envelope);
    }

    pub(crate) fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Copies of the buffered messages, for handing to a connection.
    pub(crate) fn messages(&self) -> Vec<Message> {
        self.envelopes.iter().map(|e| e.message.clone()).collect()
    }

    /// Resolve every envelope with an outcome built per message.
    pub(crate) fn resolve_all<F>(self, mut outcome: F)
    where
        F: FnMut() -> DeliveryOutcome,
    {
        for envelope in self.envelopes {
            envelope.resolve(outcome());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_tracks_bytes_and_order() {
        let mut batch = Batch::default();
        let (a, _rx_a) = Envelope::new(Message::new("Hi"));
        let (b, _rx_b) = Envelope::new(Message::new("By").with_key("k"));
        batch.push(a);
        batch.push(b);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 24 + 25);
        let values: Vec<_> = batch.messages().into_iter().map(|m| m.value).collect();
        assert_eq!(values, vec!["Hi", "By"]);
    }

    #[tokio::test]
    async fn test_resolve_all_signals_every_envelope() {
        let mut batch = Batch::default();
        let mut receivers = Vec::new();
        for value in ["a", "b", "c"] {
            let (env, rx) = Envelope::new(Message::new(value));
            batch.push(env);
            receivers.push(rx);
        }

        batch.resolve_all(|| DeliveryOutcome::Delivered);
        for rx in receivers {
            assert!(matches!(rx.await, Ok(DeliveryOutcome::Delivered)));
        }
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let (env, rx) = Envelope::new(Message::new("late"));
        drop(rx);
        env.resolve(DeliveryOutcome::Delivered);
    }
}
