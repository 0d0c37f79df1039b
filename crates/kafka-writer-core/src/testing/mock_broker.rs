//! Mock Kafka broker for integration testing.
//!
//! A lightweight TCP broker that:
//! - Accepts Kafka protocol connections
//! - Records all requests received
//! - Returns configurable responses
//!
//! [`MockBroker::host_topic`] installs Metadata and Produce handlers that
//! advertise this broker as the leader of every partition of one topic.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{
    PartitionProduceResponse, TopicProduceResponse,
};
use kafka_protocol::messages::{
    BrokerId, MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse, RequestHeader,
    ResponseHeader, TopicName,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

use crate::config::parse_address;

/// API keys for Kafka protocol
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const METADATA: i16 = 3;
    pub const API_VERSIONS: i16 = 18;
}

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes (without length prefix).
    pub request_bytes: Bytes,
}

impl BrokerCall {
    /// Decode the request header and body of this call.
    ///
    /// # Panics
    ///
    /// Panics if the request does not decode as `Req`.
    #[must_use]
    pub fn decode<Req: Decodable + HeaderVersion>(&self) -> (RequestHeader, Req) {
        let mut buf = self.request_bytes.clone();
        let header = RequestHeader::decode(&mut buf, Req::header_version(self.api_version))
            .expect("request header should decode");
        let request = Req::decode(&mut buf, self.api_version).expect("request should decode");
        (header, request)
    }
}

/// Response generator function type.
///
/// Returns the response body including the response header.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Bytes + Send + Sync>;

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
    produce_error: Arc<AtomicI16>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
            produce_error: Arc::new(AtomicI16::new(0)),
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address = actual_address.clone();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = self.call_log.clone();
        let response_handlers = self.response_handlers.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let call_log = call_log.clone();
                                let response_handlers = response_handlers.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock broker.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Serve `topic` with `partitions` partitions, all led by this broker.
    ///
    /// Must be called after [`MockBroker::start`] so the advertised address
    /// is the bound one.
    ///
    /// # Panics
    ///
    /// Panics if the broker address cannot be parsed.
    pub async fn host_topic(&self, topic: &str, partitions: i32) {
        let (host, port) = parse_address(&self.address).expect("broker address should parse");
        self.register_handler(
            api_keys::METADATA,
            responses::metadata_response(1, &host, i32::from(port), topic, partitions),
        )
        .await;
        self.register_handler(
            api_keys::PRODUCE,
            responses::produce_response(self.produce_error.clone()),
        )
        .await;
    }

    /// Answer every partition of future produce requests with `error_code`.
    ///
    /// Only affects topics installed with [`MockBroker::host_topic`].
    pub fn set_produce_error(&self, error_code: i16) {
        self.produce_error.store(error_code, Ordering::SeqCst);
    }

    /// Register a response handler for a specific API key.
    pub async fn register_handler(&self, api_key: i16, handler: ResponseGenerator) {
        self.response_handlers
            .write()
            .await
            .insert(api_key, handler);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by API key.
    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Handle a single client connection.
    async fn handle_connection(
        mut stream: TcpStream,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = Self::read_frame(&mut stream) => {
                    match result {
                        Ok(Some(frame)) => {
                            if frame.len() < 8 {
                                continue;
                            }

                            let api_key = i16::from_be_bytes([frame[0], frame[1]]);
                            let api_version = i16::from_be_bytes([frame[2], frame[3]]);
                            let correlation_id = i32::from_be_bytes([
                                frame[4], frame[5], frame[6], frame[7],
                            ]);

                            let call = BrokerCall {
                                api_key,
                                api_version,
                                correlation_id,
                                request_bytes: Bytes::from(frame),
                            };

                            call_log.write().await.push(call.clone());

                            let response = {
                                let handlers = response_handlers.read().await;
                                if let Some(handler) = handlers.get(&api_key) {
                                    handler(&call)
                                } else {
                                    Self::default_response(&call)
                                }
                            };

                            if Self::write_frame(&mut stream, &response).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break, // Connection closed
                        Err(_) => break,
                    }
                }
            }
        }
    }

    /// Read a Kafka frame (4-byte length prefix + body).
    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Write a Kafka frame (4-byte length prefix + body).
    async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(data.len() as u32);
        buf.extend_from_slice(data);
        stream.write_all(&buf).await?;
        stream.flush().await
    }

    /// Generate a default response (correlation ID only).
    fn default_response(call: &BrokerCall) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_i32(call.correlation_id);
        buf.freeze()
    }
}

/// Default response generators for the APIs the writer uses.
pub mod responses {
    use super::*;

    /// Encode a response header and body for `call`.
    ///
    /// # Panics
    ///
    /// Panics if the response cannot be encoded at the call's version.
    #[must_use]
    pub fn encode_response<Resp: Encodable + HeaderVersion>(
        call: &BrokerCall,
        response: &Resp,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        ResponseHeader::default()
            .with_correlation_id(call.correlation_id)
            .encode(&mut buf, Resp::header_version(call.api_version))
            .expect("response header should encode");
        response
            .encode(&mut buf, call.api_version)
            .expect("response should encode");
        buf.freeze()
    }

    /// Metadata response advertising one broker leading every partition.
    ///
    /// Topics other than `topic_name` are answered with
    /// `UNKNOWN_TOPIC_OR_PARTITION`.
    pub fn metadata_response(
        broker_id: i32,
        broker_host: &str,
        broker_port: i32,
        topic_name: &str,
        partition_count: i32,
    ) -> ResponseGenerator {
        let host = broker_host.to_string();
        let hosted = topic_name.to_string();

        Arc::new(move |call: &BrokerCall| {
            let (_, request) = call.decode::<MetadataRequest>();
            let requested: Vec<String> = request
                .topics
                .unwrap_or_default()
                .into_iter()
                .filter_map(|t| t.name.map(|n| n.to_string()))
                .collect();

            let topics = requested
                .into_iter()
                .map(|name| {
                    let mut topic = MetadataResponseTopic::default()
                        .with_name(Some(TopicName::from(StrBytes::from_string(name.clone()))));
                    if name == hosted {
                        topic.partitions = (0..partition_count)
                            .map(|p| {
                                MetadataResponsePartition::default()
                                    .with_partition_index(p)
                                    .with_leader_id(BrokerId(broker_id))
                                    .with_replica_nodes(vec![BrokerId(broker_id)])
                                    .with_isr_nodes(vec![BrokerId(broker_id)])
                            })
                            .collect();
                    } else {
                        topic.error_code = 3;
                    }
                    topic
                })
                .collect();

            let response = MetadataResponse::default()
                .with_brokers(vec![MetadataResponseBroker::default()
                    .with_node_id(BrokerId(broker_id))
                    .with_host(StrBytes::from_string(host.clone()))
                    .with_port(broker_port)])
                .with_controller_id(BrokerId(broker_id))
                .with_topics(topics);

            encode_response(call, &response)
        })
    }

    /// Produce response assigning consecutive offsets per partition.
    ///
    /// Record counts are read from the record batch header. While
    /// `error_code` is non-zero every partition is rejected with it and no
    /// offsets are consumed.
    pub fn produce_response(error_code: Arc<AtomicI16>) -> ResponseGenerator {
        let offsets: Arc<std::sync::Mutex<HashMap<(String, i32), i64>>> = Arc::default();

        Arc::new(move |call: &BrokerCall| {
            let (_, request) = call.decode::<ProduceRequest>();
            let error_code = error_code.load(Ordering::SeqCst);
            let mut offsets = offsets.lock().unwrap();

            let responses = request
                .topic_data
                .iter()
                .map(|topic| {
                    let name = topic.name.to_string();
                    let partition_responses = topic
                        .partition_data
                        .iter()
                        .map(|data| {
                            let response =
                                PartitionProduceResponse::default().with_index(data.index);
                            if error_code != 0 {
                                return response.with_error_code(error_code).with_base_offset(-1);
                            }
                            let count = data.records.as_ref().map_or(0, record_count);
                            let next = offsets.entry((name.clone(), data.index)).or_insert(0);
                            let base_offset = *next;
                            *next += count;
                            response.with_base_offset(base_offset)
                        })
                        .collect();
                    TopicProduceResponse::default()
                        .with_name(topic.name.clone())
                        .with_partition_responses(partition_responses)
                })
                .collect();

            encode_response(call, &ProduceResponse::default().with_responses(responses))
        })
    }

    /// Walk the v2 record batches in `records`, yielding each batch's
    /// last offset delta.
    fn batch_headers(records: &Bytes) -> impl Iterator<Item = i32> + '_ {
        let mut pos = 0usize;
        std::iter::from_fn(move || {
            let batch = records.get(pos..)?;
            if batch.len() < 27 {
                return None;
            }
            let batch_length = i32::from_be_bytes([batch[8], batch[9], batch[10], batch[11]]);
            let last_offset_delta =
                i32::from_be_bytes([batch[23], batch[24], batch[25], batch[26]]);
            pos += 12 + usize::try_from(batch_length).ok()?;
            Some(last_offset_delta)
        })
    }

    /// Number of records across all v2 record batches in `records`.
    #[must_use]
    pub fn record_count(records: &Bytes) -> i64 {
        batch_headers(records)
            .map(|delta| i64::from(delta) + 1)
            .sum()
    }

    /// Number of v2 record batches in `records`.
    #[must_use]
    pub fn batch_count(records: &Bytes) -> usize {
        batch_headers(records).count()
    }
}
