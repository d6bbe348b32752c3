//! Error classification and retry policy.
//!
//! Classification is a pure function of the error value: explicit kinds win,
//! then the error text is matched against fixed indicator lists, and anything
//! unrecognised is treated as permanent so it is never retried forever.

use std::error::Error as StdError;
use std::time::Duration;

use crate::error::{BrokerError, ClassifiedError, Error, ErrorKind};

/// Phrases that mark a failure as worth retrying.
const TRANSIENT_INDICATORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "broken pipe",
    "timeout",
    "timed out",
    "deadline exceeded",
    "network is unreachable",
    "network unreachable",
    "no route to host",
    "temporarily unavailable",
    "temporary failure",
    "service unavailable",
    "leader not available",
    "not leader for partition",
    "unexpected eof",
    "too many requests",
];

/// Phrases that mark a failure as terminal for the message.
const PERMANENT_INDICATORS: &[&str] = &[
    "invalid message",
    "invalid payload",
    "schema mismatch",
    "deserialize",
    "deserialization",
    "unmarshal",
    "malformed",
    "unknown topic",
    "message too large",
    "unsupported version",
];

/// Classify an error for the retry policy.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorKind {
    if let Some(kind) = explicit_kind(err) {
        return kind;
    }

    let text = describe(err).to_lowercase();
    if TRANSIENT_INDICATORS.iter().any(|i| text.contains(i)) {
        return ErrorKind::Transient;
    }
    if !PERMANENT_INDICATORS.iter().any(|i| text.contains(i)) {
        tracing::debug!(error = %text, "Unrecognised error, treating as permanent");
    }
    ErrorKind::Permanent
}

/// Whether a failed attempt should be retried in place.
pub fn should_retry(
    err: Option<&(dyn StdError + 'static)>,
    current_retries: u32,
    max_retries: u32,
) -> bool {
    let Some(err) = err else {
        return false;
    };
    if current_retries >= max_retries {
        return false;
    }
    classify(err) == ErrorKind::Transient
}

/// Walk the cause chain looking for a value that states its own kind.
fn explicit_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let kind = if let Some(bus) = e.downcast_ref::<Error>() {
            match bus {
                // transparent: source() skips the inner value, so look at it here
                Error::Handler(inner) => Some(inner.kind()),
                Error::Broker(inner) => Some(inner.kind()),
                _ => None,
            }
        } else if let Some(classified) = e.downcast_ref::<ClassifiedError>() {
            Some(classified.kind())
        } else {
            e.downcast_ref::<BrokerError>().map(BrokerError::kind)
        };

        match kind {
            Some(ErrorKind::Unknown) | None => current = e.source(),
            Some(kind) => return Some(kind),
        }
    }
    None
}

/// The error text plus every cause, joined the way `{err}: {cause}` would read.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        text.push_str(": ");
        text.push_str(&e.to_string());
        current = e.source();
    }
    text
}

/// Retry budget and in-place backoff for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of in-place retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry. Zero retries immediately.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_retries` times with no delay in between.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn should_retry(&self, err: &(dyn StdError + 'static), current_retries: u32) -> bool {
        should_retry(Some(err), current_retries, self.max_retries)
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `base_delay * multiplier^(attempt - 1)`, capped by `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_delay.max(self.base_delay);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}
