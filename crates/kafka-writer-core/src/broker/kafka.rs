//! Kafka wire-protocol implementation of [`Dialer`].
//!
//! Metadata requests resolve partitions and leaders; produce requests carry
//! each batch as a single v2 record batch.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{
    ApiKey, MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
};
use tracing::{debug, instrument, warn};

use crate::config::WriterConfig;
use crate::error::{Result, WriterError};
use crate::message::Message;

use super::connection::BrokerConnection;
use super::dialer::{Dialer, PartitionConnection};

/// Metadata API version used for discovery.
pub const METADATA_VERSION: i16 = 9;

/// Produce API version; the first versions carrying v2 record batches are 3..=8.
pub const PRODUCE_VERSION: i16 = 7;

const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// Dials partition leaders over plain TCP.
#[derive(Debug, Clone)]
pub struct KafkaDialer {
    client_id: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    required_acks: i16,
}

impl Default for KafkaDialer {
    fn default() -> Self {
        Self {
            client_id: "kafka-writer".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            required_acks: 1,
        }
    }
}

impl KafkaDialer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take client ID, timeouts and acks from a writer configuration.
    #[must_use]
    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.write_timeout(),
            required_acks: config.required_acks,
        }
    }

    async fn connect(&self, address: &str) -> Result<BrokerConnection> {
        let conn = BrokerConnection::with_timeouts(
            address.to_string(),
            self.connect_timeout,
            self.request_timeout,
        )
        .with_client_id(self.client_id.clone());
        conn.connect().await?;
        Ok(conn)
    }

    /// Fetch metadata for `topic` from the first broker that answers.
    #[instrument(skip(self, brokers))]
    async fn fetch_metadata(&self, brokers: &[String], topic: &str) -> Result<MetadataResponse> {
        let request = MetadataRequest::default()
            .with_topics(Some(vec![MetadataRequestTopic::default()
                .with_name(Some(TopicName::from(StrBytes::from_string(
                    topic.to_string(),
                ))))]))
            .with_allow_auto_topic_creation(false);

        let mut last_error = WriterError::NoBrokersAvailable;
        for broker in brokers {
            let result = async {
                let conn = self.connect(broker).await?;
                conn.call::<_, MetadataResponse>(ApiKey::Metadata, METADATA_VERSION, &request)
                    .await
            }
            .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(broker = %broker, error = %e, "metadata request failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Find `topic` in a metadata response and check its error code.
fn find_topic<'a>(
    response: &'a MetadataResponse,
    topic: &str,
) -> Result<&'a kafka_protocol::messages::metadata_response::MetadataResponseTopic> {
    let entry = response
        .topics
        .iter()
        .find(|t| t.name.as_ref().is_some_and(|n| n.to_string() == topic))
        .ok_or_else(|| WriterError::TopicNotFound {
            topic: topic.to_string(),
        })?;

    match entry.error_code {
        0 => Ok(entry),
        UNKNOWN_TOPIC_OR_PARTITION => Err(WriterError::TopicNotFound {
            topic: topic.to_string(),
        }),
        code => Err(WriterError::BrokerRejected {
            partition: -1,
            error_code: code,
        }),
    }
}

#[async_trait]
impl Dialer for KafkaDialer {
    #[instrument(skip(self, brokers))]
    async fn dial_leader(
        &self,
        brokers: &[String],
        topic: &str,
        partition: i32,
    ) -> Result<Box<dyn PartitionConnection>> {
        let metadata = self.fetch_metadata(brokers, topic).await?;
        let entry = find_topic(&metadata, topic)?;

        let leader_id = entry
            .partitions
            .iter()
            .find(|p| p.partition_index == partition)
            .map(|p| p.leader_id.0)
            .ok_or_else(|| WriterError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        let leader = metadata
            .brokers
            .iter()
            .find(|b| b.node_id.0 == leader_id)
            .ok_or_else(|| WriterError::LeaderNotAvailable {
                topic: topic.to_string(),
                partition,
            })?;
        let address = format!("{}:{}", leader.host, leader.port);

        debug!(leader_id, address = %address, "dialing partition leader");
        let conn = self.connect(&address).await?;

        Ok(Box::new(KafkaPartitionConnection {
            conn,
            topic: topic.to_string(),
            partition,
            required_acks: self.required_acks,
            timeout_ms: self.request_timeout.as_millis().min(i32::MAX as u128) as i32,
        }))
    }

    async fn lookup_partitions(&self, brokers: &[String], topic: &str) -> Result<Vec<i32>> {
        let metadata = self.fetch_metadata(brokers, topic).await?;
        let entry = find_topic(&metadata, topic)?;

        let mut partitions: Vec<i32> = entry.partitions.iter().map(|p| p.partition_index).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}

/// Produce connection to one partition leader.
#[derive(Debug)]
pub struct KafkaPartitionConnection {
    conn: BrokerConnection,
    topic: String,
    partition: i32,
    required_acks: i16,
    timeout_ms: i32,
}

/// Encode `messages` as one uncompressed v2 record batch.
///
/// # Errors
///
/// Returns an error if the record batch cannot be encoded.
pub fn encode_record_batch(messages: &[Message]) -> Result<bytes::Bytes> {
    let records: Vec<Record> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| Record {
            transactional: false,
            control: false,
            partition_leader_epoch: -1,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: i as i64,
            // offset - sequence must stay constant or the encoder starts a new batch
            sequence: i as i32 - 1,
            timestamp: m.timestamp_millis(),
            key: m.key.clone(),
            value: Some(m.value.clone()),
            headers: Default::default(),
        })
        .collect();

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode_with_custom_compression(
        &mut buf,
        &records,
        &options,
        None::<fn(&mut BytesMut, &mut BytesMut, Compression) -> anyhow::Result<()>>,
    )
    .map_err(|e| WriterError::ProtocolEncode {
        message: format!("failed to encode record batch: {e}"),
    })?;
    Ok(buf.freeze())
}

#[async_trait]
impl PartitionConnection for KafkaPartitionConnection {
    async fn write_messages(&mut self, messages: &[Message]) -> Result<i64> {
        let records = encode_record_batch(messages)?;

        let request = ProduceRequest::default()
            .with_acks(self.required_acks)
            .with_timeout_ms(self.timeout_ms)
            .with_topic_data(vec![TopicProduceData::default()
                .with_name(TopicName::from(StrBytes::from_string(self.topic.clone())))
                .with_partition_data(vec![PartitionProduceData::default()
                    .with_index(self.partition)
                    .with_records(Some(records))])]);

        let response: ProduceResponse = self
            .conn
            .call(ApiKey::Produce, PRODUCE_VERSION, &request)
            .await?;

        let partition = response
            .responses
            .iter()
            .filter(|t| t.name.to_string() == self.topic)
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == self.partition)
            .ok_or_else(|| WriterError::ProtocolDecode {
                message: format!("produce response is missing partition {}", self.partition),
            })?;

        if partition.error_code != 0 {
            return Err(WriterError::BrokerRejected {
                partition: self.partition,
                error_code: partition.error_code,
            });
        }

        Ok(partition.base_offset)
    }

    async fn close(&mut self) {
        self.conn.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_record_batch_header() {
        let messages = vec![
            Message::new("Hi"),
            Message::new("By").with_key("k"),
            Message::new("Yo"),
        ];
        let batch = encode_record_batch(&messages).unwrap();

        // base offset (8) + batch length (4) + leader epoch (4), then magic
        assert!(batch.len() > 61);
        assert_eq!(batch[16], 2);
        // a single batch spans the whole buffer
        let batch_length = i32::from_be_bytes([batch[8], batch[9], batch[10], batch[11]]);
        assert_eq!(12 + batch_length as usize, batch.len());
        // last offset delta
        let last_delta = i32::from_be_bytes([batch[23], batch[24], batch[25], batch[26]]);
        assert_eq!(last_delta, 2);
        // record count
        let count = i32::from_be_bytes([batch[57], batch[58], batch[59], batch[60]]);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_dialer_from_config() {
        let mut config = WriterConfig::new(vec!["localhost:9092".to_string()], "events");
        config.client_id = "orders-service".to_string();
        config.required_acks = -1;

        let dialer = KafkaDialer::from_config(&config);
        assert_eq!(dialer.client_id, "orders-service");
        assert_eq!(dialer.required_acks, -1);
        assert_eq!(dialer.request_timeout, config.write_timeout());
    }

    #[tokio::test]
    async fn test_lookup_without_reachable_broker() {
        let dialer = KafkaDialer {
            connect_timeout: Duration::from_millis(100),
            ..KafkaDialer::default()
        };
        let result = dialer
            .lookup_partitions(&["127.0.0.1:59998".to_string()], "events")
            .await;
        assert!(matches!(result, Err(WriterError::BrokerUnavailable { .. })));
    }
}
