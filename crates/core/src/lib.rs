//! # Busline Core
//!
//! Domain types and traits for the Busline message-bus client: the
//! [`Envelope`] and its builder, the error taxonomy and classifier, the call
//! [`Context`], the [`Handler`] and [`Interceptor`] seams, and the broker
//! driver traits.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. The producer, consumer and broker
//! adapters live in their own crates and depend inward on core, which keeps
//! the retry and routing policy testable against fake transports.

pub mod broker;
pub mod builder;
pub mod classify;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pipeline;

// Re-export key types at crate root for ergonomics
pub use broker::{
    BrokerReader, BrokerWriter, Compression, OutboundRecord, ReaderOptions, Record, RequiredAcks,
    StartOffset, WriterOptions, partition_for_key,
};
pub use builder::EnvelopeBuilder;
pub use classify::{RetryPolicy, classify, should_retry};
pub use context::Context;
pub use envelope::{Envelope, headers};
pub use error::{BrokerError, ClassifiedError, Error, ErrorKind, Result};
pub use handler::{Handler, HandlerFn, handler_fn};
pub use pipeline::{Interceptor, Next, Pipeline};
