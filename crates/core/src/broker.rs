//! Broker driver traits.
//!
//! The wire protocol belongs to an external client driver. These traits are
//! the seam: a driver adapter (or the in-memory broker) implements them, and
//! the producer and consumer only ever talk to the traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::Context;
use crate::error::BrokerError;

/// A record as fetched from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: DateTime<Utc>,
}

/// A record ready to be written to a specific partition.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub partition: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: DateTime<Utc>,
}

/// Writing side of a broker driver.
#[async_trait]
pub trait BrokerWriter: Send + Sync {
    /// Number of partitions of `topic`.
    async fn partitions(&self, ctx: &Context, topic: &str) -> Result<u32, BrokerError>;

    /// Write `records` to `topic` in order.
    async fn write(
        &self,
        ctx: &Context,
        topic: &str,
        records: Vec<OutboundRecord>,
    ) -> Result<(), BrokerError>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Reading side of a broker driver, bound to one topic and consumer group.
#[async_trait]
pub trait BrokerReader: Send + Sync {
    fn topic(&self) -> &str;

    fn group_id(&self) -> &str;

    /// Block until the next record is available or `ctx` ends.
    async fn fetch(&self, ctx: &Context) -> Result<Record, BrokerError>;

    /// Mark `record` as consumed for the group.
    async fn commit(&self, ctx: &Context, record: &Record) -> Result<(), BrokerError>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;
}

// ── Partitioning ──────────────────────────────────────────────────────────

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Deterministic key-to-partition mapping (32-bit FNV-1a).
///
/// Stable across processes and builds, so every producer sends a given key
/// to the same partition.
pub fn partition_for_key(key: &[u8], partitions: u32) -> i32 {
    if partitions <= 1 {
        return 0;
    }
    let hash = key.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    });
    (hash % partitions.min(i32::MAX as u32)) as i32
}

// ── Driver options ────────────────────────────────────────────────────────

/// Acknowledgement level required before a write counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// All in-sync replicas
    #[default]
    All,
    /// Fire and forget
    None,
    /// Partition leader only
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Only records written after the reader joins
    #[default]
    Newest,
    /// From the beginning of each partition
    Oldest,
    /// From an explicit offset in each partition
    At(i64),
}

impl std::fmt::Display for StartOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Newest => write!(f, "newest"),
            Self::Oldest => write!(f, "oldest"),
            Self::At(offset) => write!(f, "{offset}"),
        }
    }
}

// Accepts "newest", "oldest" or a non-negative integer.
impl Serialize for StartOffset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::At(offset) => serializer.serialize_i64(*offset),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for StartOffset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Offset(i64),
            Named(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Offset(offset) if offset >= 0 => Ok(Self::At(offset)),
            Raw::Offset(offset) => Err(serde::de::Error::custom(format!(
                "start offset must be >= 0, got {offset}"
            ))),
            Raw::Named(name) => match name.to_ascii_lowercase().as_str() {
                "newest" | "latest" => Ok(Self::Newest),
                "oldest" | "earliest" => Ok(Self::Oldest),
                other => Err(serde::de::Error::custom(format!(
                    "unknown start offset '{other}', expected newest, oldest or an offset"
                ))),
            },
        }
    }
}

/// Settings a driver applies to its writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    pub brokers: Vec<String>,
    pub max_attempts: u32,
    pub batch_timeout: Duration,
    pub required_acks: RequiredAcks,
    pub compression: Compression,
    pub async_write: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".into()],
            max_attempts: 3,
            batch_timeout: Duration::from_millis(10),
            required_acks: RequiredAcks::All,
            compression: Compression::None,
            async_write: false,
        }
    }
}

/// Settings a driver applies to its reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    pub start_offset: StartOffset,
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub max_wait: Duration,
    pub commit_interval: Duration,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
}

impl ReaderOptions {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: vec!["localhost:9092".into()],
            topic: topic.into(),
            group_id: group_id.into(),
            start_offset: StartOffset::default(),
            min_bytes: 1,
            max_bytes: 10 * 1024 * 1024,
            max_wait: Duration::from_millis(500),
            commit_interval: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(3),
            session_timeout: Duration::from_secs(30),
            rebalance_timeout: Duration::from_secs(30),
        }
    }
}
