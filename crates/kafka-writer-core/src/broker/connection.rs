//! Single Kafka broker connection.
//!
//! Manages a plain TCP connection to a single Kafka broker with correlation ID
//! tracking for request/response matching.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{Result, WriterError};

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection to a single Kafka broker.
#[derive(Debug)]
pub struct BrokerConnection {
    address: String,
    client_id: String,
    stream: Mutex<Option<TcpStream>>,
    correlation_id: AtomicI32,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl BrokerConnection {
    /// Create a new broker connection (not yet connected).
    #[must_use]
    pub fn new(address: String) -> Self {
        Self::with_timeouts(address, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a new broker connection with custom timeouts.
    #[must_use]
    pub fn with_timeouts(
        address: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            address,
            client_id: "kafka-writer".to_string(),
            stream: Mutex::new(None),
            correlation_id: AtomicI32::new(0),
            connect_timeout,
            request_timeout,
        }
    }

    /// Set the client ID sent in request headers.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the connection is established.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Connect to the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn connect(&self) -> Result<()> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to broker");
                return Err(WriterError::BrokerUnavailable {
                    address: self.address.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!("connection timeout");
                return Err(WriterError::BrokerUnavailable {
                    address: self.address.clone(),
                    message: "connection timeout".to_string(),
                });
            }
        };

        stream.set_nodelay(true)?;
        *self.stream.lock().await = Some(stream);

        debug!("connected to broker");
        Ok(())
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        *self.stream.lock().await = None;
    }

    /// Encode `request` with a fresh header, send it and decode the typed response.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the round trip or decoding fails.
    pub async fn call<Req, Resp>(
        &self,
        api_key: ApiKey,
        api_version: i16,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Encodable + HeaderVersion,
        Resp: Decodable + HeaderVersion,
    {
        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(self.next_correlation_id())
            .with_client_id(Some(StrBytes::from_string(self.client_id.clone())));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, Req::header_version(api_version))
            .map_err(|e| WriterError::ProtocolEncode {
                message: format!("failed to encode request header: {e}"),
            })?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| WriterError::ProtocolEncode {
                message: e.to_string(),
            })?;

        let mut response = self.send_request(&buf).await?;

        ResponseHeader::decode(&mut response, Resp::header_version(api_version)).map_err(
            |e| WriterError::ProtocolDecode {
                message: format!("failed to decode response header: {e}"),
            },
        )?;
        Resp::decode(&mut response, api_version).map_err(|e| WriterError::ProtocolDecode {
            message: e.to_string(),
        })
    }

    /// Send a raw request and receive the response.
    ///
    /// This method handles:
    /// - Correlation ID verification
    /// - Request framing (4-byte length prefix)
    /// - Response reading with timeout
    ///
    /// The `request_bytes` should contain the full Kafka request body (header + payload),
    /// but without the length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The connection is not established
    /// - Writing or reading fails
    /// - The response correlation ID doesn't match
    /// - The request times out
    #[instrument(skip(self, request_bytes), fields(address = %self.address))]
    pub async fn send_request(&self, request_bytes: &[u8]) -> Result<Bytes> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| WriterError::BrokerUnavailable {
            address: self.address.clone(),
            message: "not connected".to_string(),
        })?;

        // Correlation ID sits after api_key and api_version
        if request_bytes.len() < 8 {
            return Err(WriterError::ProtocolEncode {
                message: "request too short".to_string(),
            });
        }
        let correlation_id = i32::from_be_bytes([
            request_bytes[4],
            request_bytes[5],
            request_bytes[6],
            request_bytes[7],
        ]);

        debug!(
            correlation_id,
            request_len = request_bytes.len(),
            "sending request"
        );

        let mut write_buf = BytesMut::with_capacity(4 + request_bytes.len());
        write_buf.put_u32(request_bytes.len() as u32);
        write_buf.extend_from_slice(request_bytes);

        let write_result = timeout(self.request_timeout, async {
            stream.write_all(&write_buf).await?;
            stream.flush().await
        })
        .await;

        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Connection may be broken, clear it
                *guard = None;
                return Err(WriterError::Connection(e));
            }
            Err(_) => {
                *guard = None;
                return Err(WriterError::BrokerUnavailable {
                    address: self.address.clone(),
                    message: "write timeout".to_string(),
                });
            }
        }

        let read_result = timeout(self.request_timeout, async {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u32::from_be_bytes(len_buf) as usize;

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;

            Ok::<_, std::io::Error>(response_buf)
        })
        .await;

        let response_buf = match read_result {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                *guard = None;
                return Err(WriterError::Connection(e));
            }
            Err(_) => {
                // A late response would desynchronize the stream
                *guard = None;
                return Err(WriterError::BrokerUnavailable {
                    address: self.address.clone(),
                    message: "read timeout".to_string(),
                });
            }
        };

        if response_buf.len() < 4 {
            return Err(WriterError::ProtocolDecode {
                message: "response too short".to_string(),
            });
        }

        let response_correlation_id = i32::from_be_bytes([
            response_buf[0],
            response_buf[1],
            response_buf[2],
            response_buf[3],
        ]);

        if response_correlation_id != correlation_id {
            *guard = None;
            return Err(WriterError::CorrelationIdMismatch {
                expected: correlation_id,
                actual: response_correlation_id,
            });
        }

        debug!(
            correlation_id,
            response_len = response_buf.len(),
            "received response"
        );

        Ok(Bytes::from(response_buf))
    }

    /// Generate a new correlation ID.
    #[must_use]
    pub fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}
