// Per-producer write session. Maps producer sequence numbers to message ids
// and acknowledges them, coalesced, once the topic has made them durable.
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use keel_storage::{BufferOptions, GrowableLogBuffer};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::options::WriterOptions;
use crate::topic::{Topic, TopicWriteResult};
use crate::{BrokerError, Result};

/// Receives acknowledgements in the producer's own sequence space. An error
/// disposes the writer.
pub type AckHandler =
    Arc<dyn Fn(PublisherAck) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure as an [`AckHandler`].
pub fn ack_handler<F, Fut>(handler: F) -> AckHandler
where
    F: Fn(PublisherAck) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ack| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(handler(ack)) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherAck {
    /// Every write up to and including this sequence number is durable.
    pub sequence_number: i64,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub sequence_number: i64,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct WriteManyRequest {
    pub sequence_number: i64,
    pub payloads: Vec<Bytes>,
}

#[derive(Debug, Clone, Copy)]
struct IdMapEntry {
    sequence_number: i64,
    message_id: i64,
}

const ID_MAP_BUFFER: BufferOptions = BufferOptions {
    block_len: 10_000,
    directory_capacity: 128,
    min_free_blocks: 4,
};

struct WriterState {
    // Indexed by insertion order; entries are freed once acknowledged.
    id_map: GrowableLogBuffer<IdMapEntry>,
    last_acked_id: i64,
    disposed: bool,
}

pub(crate) struct WriterShared {
    key: usize,
    tracks_acks: bool,
    state: Mutex<WriterState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriterShared {
    pub(crate) fn new(key: usize, tracks_acks: bool) -> Self {
        Self {
            key,
            tracks_acks,
            state: Mutex::new(WriterState {
                id_map: GrowableLogBuffer::new(0, ID_MAP_BUFFER),
                last_acked_id: keel_common::NO_MESSAGE_ID,
                disposed: false,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn write(
        &self,
        topic: &Topic,
        sequence_number: i64,
        payloads: &[Bytes],
    ) -> Result<TopicWriteResult> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(BrokerError::WriterDisposed);
        }
        let result = topic.write_many(payloads)?;
        if self.tracks_acks && !payloads.is_empty() {
            state.id_map.add(IdMapEntry {
                sequence_number,
                message_id: result.last_inserted_id,
            });
        }
        Ok(result)
    }

    // Finds the newest write covered by `durable_id` and releases every entry
    // up to it.
    fn next_ack(&self, durable_id: i64) -> Result<Option<PublisherAck>> {
        let mut state = self.state.lock();
        if durable_id <= state.last_acked_id {
            return Ok(None);
        }
        let mut index = state.id_map.last_index();
        let mut found = None;
        'scan: for view in state.id_map.data_blocks().iter().rev() {
            for offset in (0..view.len()).rev() {
                if let Some(entry) = view.get(offset)
                    && entry.message_id <= durable_id
                {
                    found = Some((index, *entry));
                    break 'scan;
                }
                index -= 1;
            }
        }
        let Some((index, entry)) = found else {
            return Ok(None);
        };
        state.id_map.free_to(index)?;
        state.last_acked_id = entry.message_id;
        Ok(Some(PublisherAck {
            sequence_number: entry.sequence_number,
        }))
    }

    pub(crate) fn start_confirmations(
        self: &Arc<Self>,
        topic: Weak<Topic>,
        topic_name: String,
        handler: AckHandler,
        options: WriterOptions,
    ) {
        let shared = Arc::clone(self);
        let confirmations = confirmation_loop(
            Arc::clone(self),
            topic.clone(),
            topic_name,
            handler,
            options.confirmation_interval,
        );
        let handle = tokio::spawn(async move {
            if let Err(err) = confirmations.await {
                tracing::warn!(writer = shared.key, error = %err, "writer confirmations failed");
                shared.mark_disposed();
                if let Some(topic) = topic.upgrade() {
                    topic.remove_writer(&shared);
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    fn mark_disposed(&self) {
        self.state.lock().disposed = true;
        self.cancel.cancel();
    }

    /// Disposes the session and waits for its confirmation loop to exit.
    pub(crate) async fn shutdown(&self) {
        self.mark_disposed();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn confirmation_loop(
    shared: Arc<WriterShared>,
    topic: Weak<Topic>,
    topic_name: String,
    handler: AckHandler,
    interval: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(durable_id) = topic.upgrade().map(|topic| topic.durable_id()) else {
            return Ok(());
        };
        let Some(ack) = shared.next_ack(durable_id)? else {
            continue;
        };
        handler(ack).await.map_err(BrokerError::Callback)?;
        metrics::counter!("keel_acks_sent_total", "topic" => topic_name.clone()).increment(1);
    }
}

/// Producer-side handle of a writer session.
///
/// Dispose it explicitly with [`WriterHandle::dispose`]; dropping the handle
/// only cancels the confirmation loop without waiting for it.
pub struct WriterHandle {
    topic: Arc<Topic>,
    shared: Arc<WriterShared>,
}

impl WriterHandle {
    pub(crate) fn new(topic: Arc<Topic>, shared: Arc<WriterShared>) -> Self {
        Self { topic, shared }
    }

    pub fn write(&self, request: WriteRequest) -> Result<TopicWriteResult> {
        self.shared.write(
            &self.topic,
            request.sequence_number,
            std::slice::from_ref(&request.payload),
        )
    }

    pub fn write_many(&self, request: WriteManyRequest) -> Result<TopicWriteResult> {
        self.shared
            .write(&self.topic, request.sequence_number, &request.payloads)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub async fn dispose(self) {
        self.shared.shutdown().await;
        self.topic.remove_writer(&self.shared);
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.shared.mark_disposed();
        self.topic.remove_writer(&self.shared);
    }
}
