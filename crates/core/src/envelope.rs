//! Envelope: the message unit that flows through the bus.
//!
//! A caller builds an envelope with [`crate::EnvelopeBuilder`], the producer
//! writes it to a topic, and the consumer reconstructs it from a broker
//! [`Record`] before handing it to a handler.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::broker::{OutboundRecord, Record};
use crate::error::{ClassifiedError, Error, Result};

/// Well-known header keys. Downstream services read these off the wire,
/// so the strings are part of the contract.
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CONVERSATION_ID: &str = "conversation-id";
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const SOURCE: &str = "source";
    pub const TIMESTAMP: &str = "timestamp";
    pub const RETRY_COUNT: &str = "retry-count";
    pub const ORIGINAL_TOPIC: &str = "original-topic";

    // Dead-letter only
    pub const DLQ_ERROR: &str = "dlq-error";
    pub const DLQ_TIMESTAMP: &str = "dlq-timestamp";
    pub const DLQ_CONSUMER_GROUP: &str = "dlq-consumer-group";
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Partition key. Same key, same partition, same order.
    pub key: String,

    /// Opaque payload bytes
    pub payload: Vec<u8>,

    /// Header mapping (see [`headers`])
    pub headers: HashMap<String, String>,

    /// Topic the envelope was consumed from (consume path only)
    pub topic: Option<String>,

    /// Partition the envelope was consumed from (consume path only)
    pub partition: Option<i32>,

    /// Broker offset (consume path only)
    pub offset: Option<i64>,

    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create a bare envelope. Prefer [`crate::EnvelopeBuilder`], which also
    /// assigns the event id and timestamp headers.
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            topic: None,
            partition: None,
            offset: None,
            timestamp: Utc::now(),
        }
    }

    /// Rebuild an envelope from a fetched broker record.
    ///
    /// Header values are decoded as UTF-8, replacing invalid sequences.
    pub fn from_record(record: Record) -> Self {
        let headers = record
            .headers
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect();

        Self {
            key: String::from_utf8_lossy(&record.key).into_owned(),
            payload: record.value,
            headers,
            topic: Some(record.topic),
            partition: Some(record.partition),
            offset: Some(record.offset),
            timestamp: record.timestamp,
        }
    }

    /// Convert into the record a broker writer expects.
    pub fn to_outbound(&self, partition: i32) -> OutboundRecord {
        OutboundRecord {
            partition,
            key: self.key.as_bytes().to_vec(),
            value: self.payload.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
                .collect(),
            timestamp: self.timestamp,
        }
    }

    /// Check the publish pre-conditions: non-empty key and payload.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidEnvelope("key must not be empty".into()));
        }
        if self.payload.is_empty() {
            return Err(Error::InvalidEnvelope("payload must not be empty".into()));
        }
        Ok(())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Add or overwrite a header.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header(headers::EVENT_ID)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(headers::EVENT_TYPE)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    /// Current retry count, read as base-10 text.
    ///
    /// A missing header is 0. An unparsable one is also treated as 0.
    pub fn retry_count(&self) -> u32 {
        match self.header(headers::RETRY_COUNT) {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    value = %raw,
                    event_id = ?self.event_id(),
                    "Ignoring malformed retry-count header"
                );
                0
            }),
        }
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.set_header(headers::RETRY_COUNT, count.to_string());
    }

    /// Bump the retry counter and return the new value.
    pub fn increment_retry_count(&mut self) -> u32 {
        let next = self.retry_count().saturating_add(1);
        self.set_retry_count(next);
        next
    }

    /// Decode the payload as JSON.
    ///
    /// Failures come back as permanent errors: the same bytes will not decode
    /// any better on the next attempt.
    pub fn decode_json<T: DeserializeOwned>(&self) -> std::result::Result<T, ClassifiedError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            ClassifiedError::permanent(format!("failed to deserialize payload: {e}"))
                .with_detail("key", self.key.clone())
                .with_source(e)
        })
    }
}
