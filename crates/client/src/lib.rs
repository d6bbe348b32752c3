//! Busline client: producer, consumer and dead-letter routing.
//!
//! A [`Producer`] validates envelopes, runs them through its interceptor
//! pipeline and writes them to the key's partition. A [`Consumer`] fetches,
//! retries transient handler failures in place, dead-letters terminal ones
//! and commits offsets. Both talk to the broker only through the
//! [`busline_core::BrokerWriter`] and [`busline_core::BrokerReader`] traits.

pub mod consumer;
pub mod dead_letter;
pub mod logging;
pub mod producer;
pub mod wiring;

pub use consumer::{Consumer, ConsumerState, ProcessOutcome};
pub use dead_letter::{DeadLetterRouter, Failure};
pub use logging::LoggingInterceptor;
pub use producer::Producer;
pub use wiring::{builtin_interceptors, consumer_from_config, producer_from_config};

pub use busline_config::{BusinessErrorPolicy, CommitPolicy};
