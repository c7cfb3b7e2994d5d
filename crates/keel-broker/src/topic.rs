// A topic owns the log buffer, the durable message log, the writer set and the
// subscriptions of one named stream, and runs the persistence, cleanup and
// checkpoint-flush loops over them.
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::HashMap;
use keel_common::ids::SubscriptionId;
use keel_common::{FIRST_MESSAGE_ID, NO_MESSAGE_ID, now_micros, validate_name};
use keel_storage::{
    CheckpointOptions, CheckpointStore, FileCheckpointStore, FileSubscriptionCatalog,
    GrowableLogBuffer, Message, MessageLog, SegmentLogOptions, SegmentedLog, SubscriptionCatalog,
    SubscriptionRecord,
};
use parking_lot::Mutex;
use slab::Slab;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::options::{SubscriberOptions, TopicOptions, WriterOptions};
use crate::snapshot::DataSnapshot;
use crate::subscription::{PushHandler, SubscriberHandle, Subscription};
use crate::writer::{AckHandler, WriterHandle, WriterShared};
use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Created,
    Restoring,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicWriteResult {
    /// Id assigned to the last message of the write.
    pub last_inserted_id: i64,
    pub enqueued_at: i64,
}

/// Storage backends of a topic.
pub struct TopicStorage {
    pub log: Box<dyn MessageLog>,
    pub checkpoints: Box<dyn CheckpointStore>,
    pub catalog: Box<dyn SubscriptionCatalog>,
}

impl TopicStorage {
    pub fn new(
        log: impl MessageLog + 'static,
        checkpoints: impl CheckpointStore + 'static,
        catalog: impl SubscriptionCatalog + 'static,
    ) -> Self {
        Self {
            log: Box::new(log),
            checkpoints: Box::new(checkpoints),
            catalog: Box::new(catalog),
        }
    }

    /// File-backed storage rooted at `directory`.
    pub fn files(directory: &Path, options: &TopicOptions) -> Self {
        let log = SegmentedLog::new(SegmentLogOptions {
            segment_size_bytes: options.segment_size_bytes,
            ..SegmentLogOptions::new(directory)
        });
        let checkpoints = FileCheckpointStore::new(CheckpointOptions {
            compaction_threshold_bytes: options.checkpoint_compaction_bytes,
            ..CheckpointOptions::new(directory)
        });
        Self::new(log, checkpoints, FileSubscriptionCatalog::new(directory))
    }
}

struct DataState {
    buffer: GrowableLogBuffer<Message>,
    log: Box<dyn MessageLog>,
    last_message_id: i64,
    last_enqueued_at: i64,
    durable_id: i64,
    // Highest id already released by cleanup.
    cleanup_point: i64,
}

struct SubscriptionSet {
    by_name: HashMap<String, Arc<Subscription>, RandomState>,
    checkpoints: Box<dyn CheckpointStore>,
    catalog: Box<dyn SubscriptionCatalog>,
}

impl SubscriptionSet {
    fn records(&self) -> Vec<SubscriptionRecord> {
        let mut records: Vec<_> = self
            .by_name
            .values()
            .map(|subscription| SubscriptionRecord {
                id: subscription.id(),
                name: subscription.name().to_string(),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

struct TopicLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Topic {
    name: String,
    options: TopicOptions,
    state: Mutex<TopicState>,
    // Lock order: subscriptions, then data, then state; writers, then state.
    // The state lock is never held while taking another.
    data: Mutex<DataState>,
    snapshot: ArcSwap<DataSnapshot>,
    durable_id: AtomicI64,
    writers: Mutex<Slab<Arc<WriterShared>>>,
    subscriptions: Mutex<SubscriptionSet>,
    loops: Mutex<Option<TopicLoops>>,
    self_ref: Weak<Topic>,
}

impl Topic {
    pub fn new(name: impl Into<String>, options: TopicOptions, storage: TopicStorage) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            data: Mutex::new(DataState {
                buffer: GrowableLogBuffer::new(FIRST_MESSAGE_ID, options.buffer),
                log: storage.log,
                last_message_id: NO_MESSAGE_ID,
                last_enqueued_at: 0,
                durable_id: NO_MESSAGE_ID,
                cleanup_point: NO_MESSAGE_ID,
            }),
            snapshot: ArcSwap::from_pointee(DataSnapshot::empty(FIRST_MESSAGE_ID)),
            durable_id: AtomicI64::new(NO_MESSAGE_ID),
            writers: Mutex::new(Slab::new()),
            subscriptions: Mutex::new(SubscriptionSet {
                by_name: HashMap::with_hasher(RandomState::new()),
                checkpoints: storage.checkpoints,
                catalog: storage.catalog,
            }),
            loops: Mutex::new(None),
            state: Mutex::new(TopicState::Created),
            self_ref: self_ref.clone(),
            name,
            options,
        })
    }

    /// Topic backed by files in `directory`.
    pub fn open(name: impl Into<String>, directory: &Path, options: TopicOptions) -> Arc<Self> {
        let storage = TopicStorage::files(directory, &options);
        Self::new(name, options, storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    pub fn state(&self) -> TopicState {
        *self.state.lock()
    }

    /// Highest message id known to be on durable storage.
    pub fn durable_id(&self) -> i64 {
        self.durable_id.load(Ordering::Acquire)
    }

    pub fn last_message_id(&self) -> i64 {
        self.data.lock().last_message_id
    }

    /// The most recently published snapshot of the durable in-memory region.
    pub fn snapshot(&self) -> Arc<DataSnapshot> {
        self.snapshot.load_full()
    }

    /// Replays the durable log and loads subscriptions and their checkpoints.
    pub fn restore(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TopicState::Created {
                return Err(self.not_running(*state));
            }
            *state = TopicState::Restoring;
        }
        let result = self.restore_data().and_then(|last_id| self.restore_subscriptions(last_id));
        if let Err(err) = &result {
            tracing::error!(topic = %self.name, error = %err, "topic restore failed");
            *self.state.lock() = TopicState::Stopped;
        }
        result
    }

    fn restore_data(&self) -> Result<i64> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        let mut buffer: Option<GrowableLogBuffer<Message>> = None;
        let mut last_enqueued_at = 0;
        let mut restored = 0u64;
        for message in data.log.restore()? {
            let message = message?;
            let first_id = message.id;
            last_enqueued_at = message.enqueued_at;
            buffer
                .get_or_insert_with(|| GrowableLogBuffer::new(first_id, self.options.buffer))
                .add(message);
            restored += 1;
        }
        let last_id = data.log.next_id() - 1;
        let buffer =
            buffer.unwrap_or_else(|| GrowableLogBuffer::new(last_id + 1, self.options.buffer));
        if buffer.last_index() != last_id {
            return Err(BrokerError::ConsistencyFault(format!(
                "replayed log ends at {} but the log continues at {}",
                buffer.last_index(),
                last_id + 1
            )));
        }
        data.cleanup_point = buffer.first_index() - 1;
        data.buffer = buffer;
        data.last_message_id = last_id;
        data.durable_id = last_id;
        data.last_enqueued_at = last_enqueued_at;
        self.publish(data);
        tracing::info!(topic = %self.name, messages = restored, last_id, "topic log restored");
        Ok(last_id)
    }

    fn restore_subscriptions(&self, durable_id: i64) -> Result<()> {
        let mut set = self.subscriptions.lock();
        let records = set.catalog.load()?;
        let checkpoints = set.checkpoints.restore()?;
        set.by_name.clear();
        for record in records {
            let completed = checkpoints.get(&record.id).copied().unwrap_or(durable_id);
            let subscription = Subscription::new(record.id, record.name.clone(), completed);
            set.by_name.insert(record.name, Arc::new(subscription));
        }
        tracing::info!(
            topic = %self.name,
            subscriptions = set.by_name.len(),
            "topic subscriptions restored"
        );
        Ok(())
    }

    /// Launches the persistence, cleanup and checkpoint-flush loops.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TopicState::Restoring {
                return Err(self.not_running(*state));
            }
            *state = TopicState::Running;
        }
        let cancel = CancellationToken::new();
        let handles = vec![
            self.spawn_supervised(
                "persist",
                self.periodic(cancel.clone(), self.options.persist_interval, Topic::persist),
            ),
            self.spawn_supervised(
                "cleanup",
                self.periodic(cancel.clone(), self.options.cleanup_interval, Topic::cleanup),
            ),
            self.spawn_supervised(
                "checkpoint-flush",
                self.periodic(
                    cancel.clone(),
                    self.options.checkpoint_flush_interval,
                    Topic::flush_checkpoints,
                ),
            ),
        ];
        *self.loops.lock() = Some(TopicLoops { cancel, handles });
        tracing::info!(topic = %self.name, "topic started");
        Ok(())
    }

    pub fn write(&self, payload: Bytes) -> Result<TopicWriteResult> {
        self.write_many(std::slice::from_ref(&payload))
    }

    /// Appends `payloads` as consecutive messages sharing one timestamp.
    pub fn write_many(&self, payloads: &[Bytes]) -> Result<TopicWriteResult> {
        let mut data = self.data.lock();
        // Checked under the data lock so nothing slips in after the final flush.
        self.ensure_running()?;
        if payloads.is_empty() {
            return Ok(TopicWriteResult {
                last_inserted_id: data.last_message_id,
                enqueued_at: data.last_enqueued_at,
            });
        }
        let enqueued_at = now_micros().max(data.last_enqueued_at);
        let first_id = data.last_message_id + 1;
        let messages: Vec<Message> = payloads
            .iter()
            .zip(first_id..)
            .map(|(body, id)| Message::new(id, enqueued_at, body.clone()))
            .collect();
        if let Err(err) = data.log.write_batch(&messages) {
            drop(data);
            // The log may hold part of the batch now; only a restart can
            // reconcile it with the buffer.
            tracing::error!(topic = %self.name, error = %err, "log append failed");
            self.spawn_stop("log append failed");
            return Err(err.into());
        }
        let count = messages.len() as u64;
        let last_inserted_id = data.buffer.add_slice(messages);
        data.last_message_id = last_inserted_id;
        data.last_enqueued_at = enqueued_at;
        drop(data);
        metrics::counter!("keel_messages_written_total", "topic" => self.name.clone())
            .increment(count);
        Ok(TopicWriteResult {
            last_inserted_id,
            enqueued_at,
        })
    }

    pub fn create_writer(
        &self,
        ack_handler: Option<AckHandler>,
        options: WriterOptions,
    ) -> Result<WriterHandle> {
        let topic = self.strong_ref()?;
        let mut writers = self.writers.lock();
        // Checked under the writers lock that `stop` drains, so a writer is
        // either drained by it or never created.
        self.ensure_running()?;
        let entry = writers.vacant_entry();
        let shared = Arc::new(WriterShared::new(entry.key(), ack_handler.is_some()));
        entry.insert(Arc::clone(&shared));
        if let Some(handler) = ack_handler {
            shared.start_confirmations(
                self.self_ref.clone(),
                self.name.clone(),
                handler,
                options,
            );
        }
        drop(writers);
        Ok(WriterHandle::new(topic, shared))
    }

    pub(crate) fn remove_writer(&self, shared: &Arc<WriterShared>) {
        let mut writers = self.writers.lock();
        let key = shared.key();
        if writers
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            writers.remove(key);
        }
    }

    pub fn writer_count(&self) -> usize {
        self.writers.lock().len()
    }

    /// Creates a durable subscription. Without `start_from` it begins after the
    /// current durable high-water mark.
    pub fn create_subscription(&self, name: &str, start_from: Option<i64>) -> Result<SubscriptionId> {
        validate_name(name)?;
        let mut set = self.subscriptions.lock();
        self.ensure_running()?;
        if set.by_name.contains_key(name) {
            return Err(BrokerError::SubscriptionExists {
                topic: self.name.clone(),
                subscription: name.to_string(),
            });
        }
        let completed = {
            let data = self.data.lock();
            match start_from {
                None => data.durable_id,
                Some(start) => {
                    let next = data.last_message_id + 1;
                    if start > next {
                        return Err(BrokerError::InvalidStartId {
                            requested: start,
                            next,
                        });
                    }
                    // Anything before the first retained message is gone.
                    (start - 1).max(data.buffer.first_index() - 1)
                }
            }
        };
        let id = SubscriptionId::new();
        let mut records = set.records();
        records.push(SubscriptionRecord {
            id,
            name: name.to_string(),
        });
        set.catalog.store(&records)?;
        set.checkpoints.write(id, completed)?;
        set.by_name.insert(
            name.to_string(),
            Arc::new(Subscription::new(id, name.to_string(), completed)),
        );
        tracing::info!(topic = %self.name, subscription = name, completed, "subscription created");
        Ok(id)
    }

    /// Removes a subscription, detaching its live subscriber if any.
    pub async fn delete_subscription(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let session = {
            let mut set = self.subscriptions.lock();
            let Some(subscription) = set.by_name.get(name).cloned() else {
                return Err(self.subscription_not_found(name));
            };
            let records: Vec<_> = set
                .records()
                .into_iter()
                .filter(|record| record.id != subscription.id())
                .collect();
            set.catalog.store(&records)?;
            set.checkpoints.remove(subscription.id())?;
            set.by_name.remove(name);
            subscription.take_session()
        };
        if let Some(session) = session {
            session.shutdown().await;
        }
        tracing::info!(topic = %self.name, subscription = name, "subscription deleted");
        Ok(())
    }

    pub fn subscription_exists(&self, name: &str) -> bool {
        self.subscriptions.lock().by_name.contains_key(name)
    }

    /// Subscription names in lexical order.
    pub fn list_subscriptions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.subscriptions.lock().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Last completed message id of a subscription.
    pub fn completed_message_id(&self, name: &str) -> Result<i64> {
        self.subscriptions
            .lock()
            .by_name
            .get(name)
            .map(|subscription| subscription.completed())
            .ok_or_else(|| self.subscription_not_found(name))
    }

    /// Attaches a subscriber that receives every durable message after the
    /// subscription's checkpoint.
    pub fn subscribe(
        &self,
        name: &str,
        handler: PushHandler,
        options: SubscriberOptions,
    ) -> Result<SubscriberHandle> {
        let topic = self.strong_ref()?;
        let set = self.subscriptions.lock();
        // Attached under the lock `stop` takes sessions under.
        self.ensure_running()?;
        let subscription = set
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| self.subscription_not_found(name))?;
        let session = subscription.attach(&topic, handler, options)?;
        drop(set);
        Ok(SubscriberHandle::new(topic, session))
    }

    pub(crate) fn complete(&self, subscription: &Subscription, message_id: i64) -> Result<()> {
        let mut set = self.subscriptions.lock();
        if message_id <= subscription.completed() {
            return Ok(());
        }
        set.checkpoints.write(subscription.id(), message_id)?;
        subscription.set_completed(message_id);
        Ok(())
    }

    /// Stops the topic: tears down writers and subscribers, stops the loops,
    /// runs a last persistence, cleanup and checkpoint pass and closes storage.
    /// With `check_for_subscriptions` the call fails while subscriptions exist.
    pub async fn stop(&self, check_for_subscriptions: bool) -> Result<()> {
        if matches!(self.state(), TopicState::Stopping | TopicState::Stopped) {
            return Ok(());
        }
        if check_for_subscriptions {
            let count = self.subscriptions.lock().by_name.len();
            if count > 0 {
                return Err(BrokerError::SubscriptionsRemain {
                    topic: self.name.clone(),
                    count,
                });
            }
        }
        {
            let mut state = self.state.lock();
            if matches!(*state, TopicState::Stopping | TopicState::Stopped) {
                return Ok(());
            }
            *state = TopicState::Stopping;
        }
        tracing::info!(topic = %self.name, "stopping topic");

        let writers: Vec<_> = self.writers.lock().drain().collect();
        for writer in writers {
            writer.shutdown().await;
        }
        let sessions: Vec<_> = self
            .subscriptions
            .lock()
            .by_name
            .values()
            .filter_map(|subscription| subscription.take_session())
            .collect();
        for session in sessions {
            session.shutdown().await;
        }
        let loops = self.loops.lock().take();
        if let Some(loops) = loops {
            loops.cancel.cancel();
            for handle in loops.handles {
                let _ = handle.await;
            }
        }

        if let Err(err) = self.persist() {
            tracing::warn!(topic = %self.name, error = %err, "final persist failed");
        }
        if let Err(err) = self.cleanup() {
            tracing::warn!(topic = %self.name, error = %err, "final cleanup failed");
        }
        if let Err(err) = self.flush_checkpoints() {
            tracing::warn!(topic = %self.name, error = %err, "final checkpoint flush failed");
        }
        if let Err(err) = self.data.lock().log.close() {
            tracing::warn!(topic = %self.name, error = %err, "closing message log failed");
        }
        if let Err(err) = self.subscriptions.lock().checkpoints.close() {
            tracing::warn!(topic = %self.name, error = %err, "closing checkpoint store failed");
        }
        *self.state.lock() = TopicState::Stopped;
        tracing::info!(topic = %self.name, "topic stopped");
        Ok(())
    }

    // Flushes pending writes and publishes a new snapshot. Returns whether
    // anything was flushed.
    fn persist(&self) -> Result<bool> {
        let mut data = self.data.lock();
        if data.durable_id == data.last_message_id {
            return Ok(false);
        }
        if let Err(err) = data.log.flush() {
            metrics::counter!("keel_persist_failures_total", "topic" => self.name.clone())
                .increment(1);
            return Err(err.into());
        }
        data.durable_id = data.last_message_id;
        self.publish(&data);
        Ok(true)
    }

    // Releases everything every subscription has completed, never past the
    // durable high-water mark.
    fn cleanup(&self) -> Result<bool> {
        let set = self.subscriptions.lock();
        let Some(min_completed) = set
            .by_name
            .values()
            .map(|subscription| subscription.completed())
            .min()
        else {
            return Ok(false);
        };
        let mut data = self.data.lock();
        let cutoff = min_completed.min(data.durable_id);
        if cutoff <= data.cleanup_point {
            return Ok(false);
        }
        data.buffer.free_to(cutoff)?;
        data.log.free_to(cutoff)?;
        data.cleanup_point = cutoff;
        // Drop references to the released blocks so they can be reused.
        self.publish(&data);
        drop(data);
        drop(set);
        metrics::counter!("keel_cleanup_truncations_total", "topic" => self.name.clone())
            .increment(1);
        tracing::debug!(topic = %self.name, cutoff, "topic log truncated");
        Ok(true)
    }

    fn flush_checkpoints(&self) -> Result<bool> {
        let mut set = self.subscriptions.lock();
        if let Err(err) = set.checkpoints.flush() {
            metrics::counter!(
                "keel_checkpoint_flush_failures_total",
                "topic" => self.name.clone()
            )
            .increment(1);
            return Err(err.into());
        }
        Ok(true)
    }

    fn publish(&self, data: &DataState) {
        self.snapshot
            .store(Arc::new(DataSnapshot::capture(&data.buffer, data.durable_id)));
        self.durable_id.store(data.durable_id, Ordering::Release);
        metrics::gauge!("keel_durable_message_id", "topic" => self.name.clone())
            .set(data.durable_id as f64);
    }

    // Runs `tick` every `interval` until cancelled, giving up after the
    // configured number of consecutive failures.
    fn periodic(
        &self,
        cancel: CancellationToken,
        interval: Duration,
        tick: fn(&Topic) -> Result<bool>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let weak = self.self_ref.clone();
        let max_failures = self.options.max_consecutive_failures.max(1);
        async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(topic) = weak.upgrade() else {
                    return Ok(());
                };
                match tick(&topic) {
                    Ok(_) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        tracing::warn!(
                            topic = %topic.name,
                            failures,
                            error = %err,
                            "topic task failed"
                        );
                        if failures >= max_failures {
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn spawn_supervised(
        &self,
        task: &'static str,
        work: impl Future<Output = Result<()>> + Send + 'static,
    ) -> JoinHandle<()> {
        let topic = self.self_ref.clone();
        tokio::spawn(async move {
            if let Err(err) = work.await
                && let Some(topic) = topic.upgrade()
            {
                tracing::error!(topic = %topic.name, task, error = %err, "topic task gave up");
                topic.spawn_stop(task);
            }
        })
    }

    // Stops the topic from a separate task so the caller never awaits itself.
    fn spawn_stop(&self, reason: &'static str) {
        let Some(topic) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tracing::warn!(topic = %topic.name, reason, "stopping topic after failure");
            if let Err(err) = topic.stop(false).await {
                tracing::error!(topic = %topic.name, error = %err, "topic stop failed");
            }
        });
    }

    fn ensure_running(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == TopicState::Running {
            Ok(())
        } else {
            Err(self.not_running(state))
        }
    }

    fn strong_ref(&self) -> Result<Arc<Topic>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| self.not_running(TopicState::Stopped))
    }

    fn not_running(&self, state: TopicState) -> BrokerError {
        BrokerError::NotRunning {
            topic: self.name.clone(),
            state,
        }
    }

    fn subscription_not_found(&self, name: &str) -> BrokerError {
        BrokerError::SubscriptionNotFound {
            topic: self.name.clone(),
            subscription: name.to_string(),
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("durable_id", &self.durable_id())
            .finish()
    }
}
