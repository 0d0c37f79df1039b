//! Application messages handed to the writer.

use std::time::SystemTime;

use bytes::Bytes;

/// Fixed per-message framing overhead counted against `batch_bytes`.
///
/// crc (4) + magic (1) + attributes (1) + timestamp (8) + key length (4) +
/// value length (4).
pub const MESSAGE_OVERHEAD: u64 = 22;

/// A single message to be written to the topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Optional key, used by the hash balancer.
    pub key: Option<Bytes>,
    /// Message payload.
    pub value: Bytes,
    /// Explicit partition; bypasses the balancer when set.
    pub partition: Option<i32>,
    /// Creation time; the time of the write is used when unset.
    pub timestamp: Option<SystemTime>,
}

impl Message {
    /// Create a keyless message.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pin the message to a partition.
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the message timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Size of the message as counted against the batch byte limit.
    #[must_use]
    pub fn size(&self) -> u64 {
        let key_len = self.key.as_ref().map_or(0, Bytes::len);
        (key_len + self.value.len()) as u64 + MESSAGE_OVERHEAD
    }

    /// Timestamp in milliseconds since the Unix epoch.
    pub(crate) fn timestamp_millis(&self) -> i64 {
        let ts = self.timestamp.unwrap_or_else(SystemTime::now);
        ts.duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_size_includes_overhead() {
        assert_eq!(Message::new("Hi").size(), 24);
        assert_eq!(Message::new("Hello World!").size(), 34);
    }

    #[test]
    fn test_size_counts_key() {
        let msg = Message::new("value").with_key("key");
        assert_eq!(msg.size(), 3 + 5 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_builder() {
        let ts = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        let msg = Message::new("v").with_partition(4).with_timestamp(ts);
        assert_eq!(msg.partition, Some(4));
        assert_eq!(msg.timestamp_millis(), 1_500);
    }
}
