//! Error types for the Busline domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Three layers:
//! - [`Error`] is what every public operation returns.
//! - [`BrokerError`] is what a broker driver returns; its variant fixes its kind.
//! - [`ClassifiedError`] is what handlers return when they know how a failure
//!   should be treated by the retry policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The top-level error type for all Busline operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Caller errors ---
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    // --- Lifecycle ---
    #[error("producer closed")]
    ProducerClosed,

    #[error("consumer closed")]
    ConsumerClosed,

    #[error("consumer is already running")]
    ConsumerRunning,

    // --- Context ---
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    // --- Broker ---
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    // --- Handler ---
    #[error(transparent)]
    Handler(#[from] ClassifiedError),

    // --- Serialization ---
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Dead letter ---
    #[error("{original}; dead-letter publish also failed: {dead_letter}")]
    DeadLetter {
        original: Box<Error>,
        dead_letter: Box<Error>,
    },

    // --- Generic ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error comes from the call context rather than the work itself.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Classification ---

/// How a failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Expected to clear on retry (connectivity blips, timeouts).
    Transient,
    /// Retrying will not help (malformed or incompatible payload).
    Permanent,
    /// Explicit application-level rejection. Never retried.
    Business,
    /// No explicit kind; the classifier falls back to text matching.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Business => write!(f, "business"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure annotated with an explicit [`ErrorKind`].
///
/// Handlers construct these with [`ClassifiedError::transient`],
/// [`ClassifiedError::permanent`] or [`ClassifiedError::business`] so the
/// consumer does not have to guess from the error text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
    details: BTreeMap<String, String>,
}

impl ClassifiedError {
    /// An error with no explicit kind. It will be classified by its text.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Unknown, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Permanent, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Business, message)
    }

    fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            details: BTreeMap::new(),
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach a diagnostic detail (entity id, field name, ...).
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }
}

// --- Broker errors ---

/// Failures reported by a broker driver.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unavailable: connection refused ({0})")]
    Unavailable(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("leader not available for {topic}/{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    #[error("unknown topic or partition: {0}")]
    UnknownTopic(String),

    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("broker session failed: {0}")]
    Fatal(String),

    #[error("broker client closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// The kind implied by the variant, or `Unknown` for free-form errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::LeaderNotAvailable { .. } => {
                ErrorKind::Transient
            }
            Self::UnknownTopic(_) | Self::MessageTooLarge { .. } | Self::Fatal(_) | Self::Closed => {
                ErrorKind::Permanent
            }
            Self::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Infrastructure failures that no amount of re-fetching will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn classified_error_keeps_kind_and_details() {
        let err = ClassifiedError::business("order already shipped")
            .with_detail("order_id", "order-1");
        assert_eq!(err.kind(), ErrorKind::Business);
        assert_eq!(err.details().get("order_id").map(String::as_str), Some("order-1"));
        assert_eq!(err.to_string(), "order already shipped");
    }

    #[test]
    fn classified_error_exposes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ClassifiedError::new("db write failed").with_source(io);
        assert!(err.source().is_some());
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn dead_letter_error_mentions_both_failures() {
        let err = Error::DeadLetter {
            original: Box::new(Error::Broker(BrokerError::Timeout("write".into()))),
            dead_letter: Box::new(Error::Broker(BrokerError::Closed)),
        };
        let text = err.to_string();
        assert!(text.contains("request timeout"));
        assert!(text.contains("broker client closed"));
    }

    #[test]
    fn broker_error_kinds() {
        assert_eq!(BrokerError::Unavailable("b1".into()).kind(), ErrorKind::Transient);
        assert_eq!(BrokerError::UnknownTopic("t".into()).kind(), ErrorKind::Permanent);
        assert_eq!(BrokerError::Other("?".into()).kind(), ErrorKind::Unknown);
        assert!(BrokerError::Closed.is_fatal());
        assert!(!BrokerError::Timeout("t".into()).is_fatal());
    }

    #[test]
    fn context_errors_are_flagged() {
        assert!(Error::Cancelled.is_context());
        assert!(Error::DeadlineExceeded.is_context());
        assert!(!Error::ProducerClosed.is_context());
    }
}
