use std::path::PathBuf;
use std::time::Duration;

use keel_storage::BufferOptions;

const DEFAULT_PERSIST_INTERVAL_MS: u64 = 50;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 25;
const DEFAULT_CHECKPOINT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
const DEFAULT_SEGMENT_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_CHECKPOINT_COMPACTION_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_CONFIRMATION_INTERVAL_MS: u64 = 50;
const DEFAULT_PUSH_INTERVAL_MS: u64 = 50;
const DEFAULT_MAX_BATCH: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicOptions {
    /// How often pending writes are flushed and a new snapshot is published.
    pub persist_interval: Duration,
    pub cleanup_interval: Duration,
    pub checkpoint_flush_interval: Duration,
    /// Consecutive flush failures a loop tolerates before stopping the topic.
    pub max_consecutive_failures: u32,
    pub buffer: BufferOptions,
    pub segment_size_bytes: u64,
    pub checkpoint_compaction_bytes: u64,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_millis(DEFAULT_PERSIST_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            checkpoint_flush_interval: Duration::from_millis(DEFAULT_CHECKPOINT_FLUSH_INTERVAL_MS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            buffer: BufferOptions::default(),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE_BYTES,
            checkpoint_compaction_bytes: DEFAULT_CHECKPOINT_COMPACTION_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub confirmation_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            confirmation_interval: Duration::from_millis(DEFAULT_CONFIRMATION_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Upper bound on messages handed to one push call.
    pub max_batch: usize,
    pub push_interval: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            push_interval: Duration::from_millis(DEFAULT_PUSH_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOptions {
    /// Root directory; each topic lives in `<data_dir>/<topic>/`.
    pub data_dir: PathBuf,
    pub topic: TopicOptions,
}

impl BrokerOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            topic: TopicOptions::default(),
        }
    }
}
