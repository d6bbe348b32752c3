//! In-memory broker for Busline.
//!
//! Implements [`BrokerWriter`](busline_core::BrokerWriter) and
//! [`BrokerReader`](busline_core::BrokerReader) over partitioned in-process
//! logs with per-group committed offsets. Useful for tests, local runs and
//! the `busline simulate` command. Faults can be queued on the write, fetch
//! and commit paths to exercise retry and dead-letter handling.

pub mod memory;
pub mod reader;
pub mod writer;

pub use memory::MemoryBroker;
pub use reader::MemoryReader;
pub use writer::MemoryWriter;
