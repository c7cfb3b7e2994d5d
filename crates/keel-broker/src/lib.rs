// Durable topic engine.
// A topic appends messages to an in-memory log buffer and a segmented on-disk
// log, publishes an immutable snapshot of the durable region once per
// persistence tick, acknowledges writers from that high-water mark and streams
// the snapshot to attached subscribers.
use keel_storage::StorageError;

pub mod broker;
pub mod options;
pub mod snapshot;
pub mod subscription;
pub mod topic;
pub mod writer;

pub use broker::Broker;
pub use keel_storage::{BufferOptions, Message};
pub use options::{BrokerOptions, SubscriberOptions, TopicOptions, WriterOptions};
pub use snapshot::DataSnapshot;
pub use subscription::{PushHandler, SubscriberHandle, push_handler};
pub use topic::{Topic, TopicState, TopicStorage, TopicWriteResult};
pub use writer::{
    AckHandler, PublisherAck, WriteManyRequest, WriteRequest, WriterHandle, ack_handler,
};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error(transparent)]
    InvalidName(#[from] keel_common::Error),
    #[error("subscription {subscription} already exists in topic {topic}")]
    SubscriptionExists { topic: String, subscription: String },
    #[error("subscription {subscription} not found in topic {topic}")]
    SubscriptionNotFound { topic: String, subscription: String },
    #[error("subscription {subscription} in topic {topic} already has a subscriber")]
    SubscriptionInUse { topic: String, subscription: String },
    #[error("topic {topic} still has {count} subscriptions")]
    SubscriptionsRemain { topic: String, count: usize },
    #[error("start id {requested} is beyond the next message id {next}")]
    InvalidStartId { requested: i64, next: i64 },
    #[error("topic {topic} is not running (state {state:?})")]
    NotRunning { topic: String, state: TopicState },
    #[error("writer is disposed")]
    WriterDisposed,
    #[error("subscriber is disposed")]
    SubscriberDisposed,
    #[error("consistency fault: {0}")]
    ConsistencyFault(String),
    #[error("callback failed: {0:#}")]
    Callback(anyhow::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
