//! Fluent construction of envelopes.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::envelope::{Envelope, headers};
use crate::error::{Error, Result};

/// Builds an [`Envelope`] with chained setters.
///
/// ```ignore
/// let envelope = EnvelopeBuilder::new()
///     .key(order.id.clone())
///     .json_payload(&order)
///     .event_type("order.created")
///     .source("orders-api")
///     .build()?;
/// ```
///
/// `build()` guarantees an `event-id` and a `timestamp` header. It performs
/// no validation and no I/O; the producer checks key and payload on publish.
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    key: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    payload_error: Option<serde_json::Error>,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the raw payload bytes.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self.payload_error = None;
        self
    }

    /// Serialize `value` as JSON into the payload.
    ///
    /// A serialization failure is held and returned by [`build`](Self::build).
    pub fn json_payload<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.payload = bytes;
                self.payload_error = None;
            }
            Err(e) => {
                self.payload.clear();
                self.payload_error = Some(e);
            }
        }
        self
    }

    /// Add or overwrite a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn event_id(self, id: impl Into<String>) -> Self {
        self.header(headers::EVENT_ID, id)
    }

    pub fn event_type(self, event_type: impl Into<String>) -> Self {
        self.header(headers::EVENT_TYPE, event_type)
    }

    pub fn correlation_id(self, id: impl Into<String>) -> Self {
        self.header(headers::CORRELATION_ID, id)
    }

    pub fn conversation_id(self, id: impl Into<String>) -> Self {
        self.header(headers::CONVERSATION_ID, id)
    }

    pub fn schema_version(self, version: impl Into<String>) -> Self {
        self.header(headers::SCHEMA_VERSION, version)
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.header(headers::SOURCE, source)
    }

    /// Finish the envelope.
    pub fn build(self) -> Result<Envelope> {
        if let Some(e) = self.payload_error {
            return Err(Error::Serialization(e));
        }

        let now = Utc::now();
        let mut map = self.headers;
        map.entry(headers::EVENT_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        map.entry(headers::TIMESTAMP.to_string())
            .or_insert_with(|| now.to_rfc3339_opts(SecondsFormat::Secs, true));

        Ok(Envelope {
            key: self.key,
            payload: self.payload,
            headers: map,
            topic: None,
            partition: None,
            offset: None,
            timestamp: now,
        })
    }
}
