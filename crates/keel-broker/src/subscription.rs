// Durable subscription cursors and the live delivery session that streams a
// topic's durable messages to one attached consumer.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use keel_common::ids::SubscriptionId;
use keel_storage::Message;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::options::SubscriberOptions;
use crate::snapshot::DataSnapshot;
use crate::topic::Topic;
use crate::{BrokerError, Result};

/// Receives batches of consecutive messages. An error tears down the session;
/// the consumer resubscribes to resume after its last completed id.
pub type PushHandler =
    Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`PushHandler`].
pub fn push_handler<F, Fut>(handler: F) -> PushHandler
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |batch| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(handler(batch)) })
}

pub(crate) struct Subscription {
    id: SubscriptionId,
    name: String,
    completed: AtomicI64,
    session: Mutex<Option<Arc<DeliverySession>>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, name: String, completed: i64) -> Self {
        Self {
            id,
            name,
            completed: AtomicI64::new(completed),
            session: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn completed(&self) -> i64 {
        self.completed.load(Ordering::Acquire)
    }

    // Callers hold the topic's subscription lock, which orders updates.
    pub(crate) fn set_completed(&self, message_id: i64) {
        self.completed.fetch_max(message_id, Ordering::AcqRel);
    }

    pub(crate) fn take_session(&self) -> Option<Arc<DeliverySession>> {
        self.session.lock().take()
    }

    pub(crate) fn attach(
        self: &Arc<Self>,
        topic: &Arc<Topic>,
        handler: PushHandler,
        options: SubscriberOptions,
    ) -> Result<Arc<DeliverySession>> {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|session| !session.is_disposed()) {
            return Err(BrokerError::SubscriptionInUse {
                topic: topic.name().to_string(),
                subscription: self.name.clone(),
            });
        }
        let session = Arc::new(DeliverySession {
            subscription: Arc::clone(self),
            topic: Arc::downgrade(topic),
            topic_name: topic.name().to_string(),
            handler,
            options,
            sent: AtomicI64::new(self.completed()),
            in_flight: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            push_task: Mutex::new(None),
        });
        session.start();
        *slot = Some(Arc::clone(&session));
        tracing::debug!(
            topic = %session.topic_name,
            subscription = %self.name,
            from = session.sent() + 1,
            "subscriber attached"
        );
        Ok(session)
    }

    fn detach(&self, session: &Arc<DeliverySession>) {
        let mut slot = self.session.lock();
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            *slot = None;
        }
    }
}

pub(crate) struct DeliverySession {
    subscription: Arc<Subscription>,
    topic: Weak<Topic>,
    topic_name: String,
    handler: PushHandler,
    options: SubscriberOptions,
    // Id of the last message handed to the consumer.
    sent: AtomicI64,
    in_flight: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    push_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl DeliverySession {
    fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(err) = delivery_loop(Arc::clone(&session)).await {
                tracing::warn!(
                    topic = %session.topic_name,
                    subscription = %session.subscription.name,
                    error = %err,
                    "delivery session failed"
                );
                session.teardown();
            }
        });
        *self.task.lock() = Some(handle);
    }

    fn sent(&self) -> i64 {
        self.sent.load(Ordering::Acquire)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn teardown(self: &Arc<Self>) {
        self.disposed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.subscription.detach(self);
    }

    /// Tears the session down and waits for its delivery work to finish.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        self.teardown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let push = self.push_task.lock().take();
        if let Some(push) = push {
            let _ = push.await;
        }
    }

    // Surfaces the outcome of a push task that has already finished.
    async fn reap_push(&self) -> Result<()> {
        let finished = {
            let mut slot = self.push_task.lock();
            if slot.as_ref().is_some_and(JoinHandle::is_finished) {
                slot.take()
            } else {
                None
            }
        };
        match finished {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join) => Err(BrokerError::Callback(join.into())),
            },
        }
    }

    async fn push(&self, snapshot: Arc<DataSnapshot>) -> Result<()> {
        let mut sent = self.sent();
        let start = snapshot.start_message_id();
        if sent + 1 < start {
            // Cleanup only releases completed messages, so a gap is legitimate
            // only when the consumer completed past what it was sent.
            if self.subscription.completed() + 1 < start {
                return Err(BrokerError::ConsistencyFault(format!(
                    "next message {} of subscription {} was released (snapshot starts at {start})",
                    sent + 1,
                    self.subscription.name
                )));
            }
            sent = start - 1;
            self.sent.store(sent, Ordering::Release);
        }

        let max_batch = self.options.max_batch.max(1);
        let mut batch = Vec::with_capacity(max_batch.min(snapshot.len()));
        for view in snapshot.tail_after(sent) {
            for message in view.iter() {
                batch.push(message.clone());
                if batch.len() == max_batch {
                    self.send(&mut sent, std::mem::take(&mut batch)).await?;
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                }
            }
            if !batch.is_empty() {
                self.send(&mut sent, std::mem::take(&mut batch)).await?;
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn send(&self, sent: &mut i64, batch: Vec<Message>) -> Result<()> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };
        let (first, last) = (first.id, last.id);
        let count = batch.len();
        if first != *sent + 1 || last != *sent + count as i64 {
            return Err(BrokerError::ConsistencyFault(format!(
                "batch for subscription {} spans {first}..={last}, expected {} messages after {}",
                self.subscription.name, count, *sent
            )));
        }
        (self.handler)(batch).await.map_err(BrokerError::Callback)?;
        *sent = last;
        self.sent.store(last, Ordering::Release);
        metrics::counter!("keel_messages_delivered_total", "topic" => self.topic_name.clone())
            .increment(count as u64);
        Ok(())
    }
}

async fn delivery_loop(session: Arc<DeliverySession>) -> Result<()> {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(session.options.push_interval) => {}
        }
        session.reap_push().await?;
        let Some(topic) = session.topic.upgrade() else {
            return Ok(());
        };
        if topic.durable_id() <= session.sent() {
            continue;
        }
        if session
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        let snapshot = topic.snapshot();
        drop(topic);
        let pusher = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            let result = pusher.push(snapshot).await;
            // A failed push keeps the guard set until the loop observes it.
            if result.is_ok() {
                pusher.in_flight.store(false, Ordering::Release);
            }
            result
        });
        *session.push_task.lock() = Some(handle);
    }
}

/// Consumer-side handle of an attached subscription.
pub struct SubscriberHandle {
    topic: Arc<Topic>,
    session: Arc<DeliverySession>,
}

impl SubscriberHandle {
    pub(crate) fn new(topic: Arc<Topic>, session: Arc<DeliverySession>) -> Self {
        Self { topic, session }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.session.subscription.id
    }

    pub fn subscription_name(&self) -> &str {
        &self.session.subscription.name
    }

    pub fn last_sent_id(&self) -> i64 {
        self.session.sent()
    }

    pub fn is_disposed(&self) -> bool {
        self.session.is_disposed()
    }

    /// Marks every message up to `message_id` as processed. Ids at or below
    /// the current checkpoint are ignored.
    pub fn complete(&self, message_id: i64) -> Result<()> {
        if self.session.is_disposed() {
            return Err(BrokerError::SubscriberDisposed);
        }
        self.topic.complete(&self.session.subscription, message_id)
    }

    pub async fn dispose(self) {
        self.session.shutdown().await;
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription_name())
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.session.teardown();
    }
}
