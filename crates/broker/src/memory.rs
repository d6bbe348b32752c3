//! Shared broker state and the [`MemoryBroker`] handle.

use busline_core::{BrokerError, Error, ReaderOptions, Record, WriterOptions};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::reader::MemoryReader;
use crate::writer::MemoryWriter;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Partition logs of one topic, indexed by partition number.
pub(crate) type PartitionLogs = Vec<Vec<Record>>;

/// `(group, topic, partition)`
type CommitKey = (String, String, i32);

pub(crate) struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on every successful write so blocked fetches re-check.
    pub(crate) appended: Notify,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct BrokerState {
    pub(crate) topics: HashMap<String, PartitionLogs>,
    /// Next offset to read, per group.
    pub(crate) committed: HashMap<CommitKey, i64>,
    pub(crate) default_partitions: u32,
    pub(crate) auto_create_topics: bool,
    pub(crate) max_message_bytes: usize,
    pub(crate) write_faults: VecDeque<BrokerError>,
    pub(crate) fetch_faults: VecDeque<BrokerError>,
    pub(crate) commit_faults: VecDeque<BrokerError>,
    pub(crate) write_calls: usize,
}

impl BrokerState {
    /// The partition logs of `topic`, creating the topic if allowed.
    pub(crate) fn topic_mut(&mut self, topic: &str) -> Result<&mut PartitionLogs, BrokerError> {
        if !self.topics.contains_key(topic) {
            if !self.auto_create_topics {
                return Err(BrokerError::UnknownTopic(topic.to_string()));
            }
            let partitions = self.default_partitions.max(1);
            tracing::info!(topic = %topic, partitions, "Auto-creating topic");
            self.topics
                .insert(topic.to_string(), vec![Vec::new(); partitions as usize]);
        }
        self.topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    pub(crate) fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }
}

/// Map a finished call context onto the error a network driver would report.
pub(crate) fn context_error(err: Error) -> BrokerError {
    match err {
        Error::DeadlineExceeded => BrokerError::Timeout("context deadline exceeded".into()),
        other => BrokerError::Other(other.to_string()),
    }
}

/// Handle to an in-process broker. Clones share the same topics.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// A broker that auto-creates single-partition topics.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    default_partitions: 1,
                    auto_create_topics: true,
                    max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
                    write_faults: VecDeque::new(),
                    fetch_faults: VecDeque::new(),
                    commit_faults: VecDeque::new(),
                    write_calls: 0,
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// Partition count for auto-created topics.
    pub fn with_partitions(self, partitions: u32) -> Self {
        self.shared.lock().default_partitions = partitions.max(1);
        self
    }

    /// When disabled, writes and fetches to unknown topics fail.
    pub fn with_auto_create(self, enabled: bool) -> Self {
        self.shared.lock().auto_create_topics = enabled;
        self
    }

    /// Largest payload a single record may carry.
    pub fn with_max_message_bytes(self, limit: usize) -> Self {
        self.shared.lock().max_message_bytes = limit;
        self
    }

    /// Create `topic` with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.shared.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    pub fn writer(&self, options: WriterOptions) -> MemoryWriter {
        MemoryWriter::new(self.shared.clone(), options)
    }

    pub fn reader(&self, options: ReaderOptions) -> MemoryReader {
        MemoryReader::new(self.shared.clone(), options)
    }

    // ── Fault injection ───────────────────────────────────────────────

    /// Fail the next `times` write attempts with `error`.
    ///
    /// Attempts, not calls: a writer with `max_attempts = 3` consumes up to
    /// three queued transient faults inside one `write`.
    pub fn fail_writes(&self, error: BrokerError, times: usize) {
        let mut state = self.shared.lock();
        state.write_faults.extend(std::iter::repeat_n(error, times));
    }

    /// Fail the next `times` fetches with `error`.
    pub fn fail_fetches(&self, error: BrokerError, times: usize) {
        let mut state = self.shared.lock();
        state.fetch_faults.extend(std::iter::repeat_n(error, times));
        drop(state);
        // Blocked fetches must see the fault.
        self.shared.appended.notify_waiters();
    }

    /// Fail the next `times` commits with `error`.
    pub fn fail_commits(&self, error: BrokerError, times: usize) {
        let mut state = self.shared.lock();
        state.commit_faults.extend(std::iter::repeat_n(error, times));
    }

    // ── Inspection ────────────────────────────────────────────────────

    /// Every record in `topic`, partition by partition, in offset order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Number of `write` calls that reached the broker, successful or not.
    pub fn write_calls(&self) -> usize {
        self.shared.lock().write_calls
    }

    /// Next offset `group` will read from `topic`/`partition`, if it has
    /// committed anything.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared.lock().committed(group, topic, partition)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.topics())
            .finish()
    }
}
