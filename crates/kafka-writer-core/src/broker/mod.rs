//! Broker connection management.
//!
//! This module provides:
//! - The [`Dialer`] and [`PartitionConnection`] seams used by the writer
//! - A single-broker TCP connection with request/response correlation
//! - The Kafka wire-protocol dialer used by default

pub mod connection;
pub mod dialer;
pub mod kafka;

pub use connection::BrokerConnection;
pub use dialer::{Dialer, PartitionConnection};
pub use kafka::{KafkaDialer, KafkaPartitionConnection};
