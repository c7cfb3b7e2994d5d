// Storage building blocks for a single topic: the in-memory log buffer, the
// segmented on-disk message log, subscription checkpoints and the small JSON
// catalogs that name topics and subscriptions.
use std::io;

pub mod buffer;
pub mod catalog;
pub mod checkpoint;
pub mod memory;
pub mod message;
pub mod segment_log;

pub use buffer::{BlockView, BufferOptions, GrowableLogBuffer};
pub use catalog::{
    FileSubscriptionCatalog, SubscriptionCatalog, SubscriptionRecord, TopicCatalog, TopicRecord,
};
pub use checkpoint::{CheckpointOptions, CheckpointStore, FileCheckpointStore};
pub use memory::{MemoryCheckpointStore, MemoryLog, MemorySubscriptionCatalog};
pub use message::Message;
pub use segment_log::{MessageLog, SegmentLogOptions, SegmentedLog};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("index {index} is out of range (first {first}, last {last})")]
    OutOfRange { index: i64, first: i64, last: i64 },
    #[error("message id {actual} written out of sequence (expected {expected})")]
    Sequence { expected: i64, actual: i64 },
    #[error("storage used before restore")]
    NotRestored,
    #[error("storage is closed")]
    Closed,
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}
