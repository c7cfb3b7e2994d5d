use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keel_broker::{
    Broker, BrokerError, BrokerOptions, Message, PublisherAck, PushHandler, SubscriberOptions,
    TopicOptions, WriteManyRequest, WriteRequest, WriterOptions, ack_handler, push_handler,
};
use parking_lot::Mutex;

fn options(dir: &Path) -> BrokerOptions {
    BrokerOptions {
        data_dir: dir.to_path_buf(),
        topic: TopicOptions {
            persist_interval: Duration::from_millis(5),
            cleanup_interval: Duration::from_millis(5),
            checkpoint_flush_interval: Duration::from_millis(5),
            segment_size_bytes: 512,
            ..TopicOptions::default()
        },
    }
}

fn fast_subscriber() -> SubscriberOptions {
    SubscriberOptions {
        max_batch: 100,
        push_interval: Duration::from_millis(5),
    }
}

fn fast_writer() -> WriterOptions {
    WriterOptions {
        confirmation_interval: Duration::from_millis(5),
    }
}

fn collector() -> (PushHandler, Arc<Mutex<Vec<Message>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = push_handler(move |messages: Vec<Message>| {
        sink.lock().extend(messages);
        async { Ok(()) }
    });
    (handler, received)
}

fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.id).collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn restart_replays_the_same_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    for batch in 1..=20usize {
        let payloads: Vec<_> = (0..batch)
            .map(|i| Bytes::from(format!("{batch}-{i}")))
            .collect();
        topic.write_many(&payloads).expect("write");
    }
    let expected_last = (1..=20i64).sum::<i64>();
    assert_eq!(topic.last_message_id(), expected_last);
    wait_until(|| topic.durable_id() == expected_last).await;
    let before: Vec<Message> = topic.snapshot().iter().cloned().collect();
    broker.stop().await;

    let broker = Broker::open(options(dir.path())).await.expect("reopen");
    let topic = broker.get_topic("orders").await.expect("restored");
    let after: Vec<Message> = topic.snapshot().iter().cloned().collect();
    assert_eq!(after, before);
    assert_eq!(ids(&after), (1..=expected_last).collect::<Vec<_>>());

    let next = topic.write(Bytes::from_static(b"next")).expect("write");
    assert_eq!(next.last_inserted_id, expected_last + 1);
    broker.stop().await;
}

#[tokio::test]
async fn acks_arrive_in_order_once_durable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");

    let acks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&acks);
    let watched = Arc::clone(&topic);
    let handler = ack_handler(move |ack: PublisherAck| {
        sink.lock().push((ack.sequence_number, watched.durable_id()));
        async { Ok(()) }
    });
    let writer = topic
        .create_writer(Some(handler), fast_writer())
        .expect("writer");
    for sequence_number in 100..110 {
        writer
            .write(WriteRequest {
                sequence_number,
                payload: Bytes::from_static(b"m"),
            })
            .expect("write");
    }
    writer
        .write_many(WriteManyRequest {
            sequence_number: 110,
            payloads: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        })
        .expect("write many");

    wait_until(|| acks.lock().last().is_some_and(|(sequence, _)| *sequence == 110)).await;
    let seen = acks.lock().clone();
    assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
    // Sequence 100 maps to id 1; the final batch ends at id 12.
    for (sequence, durable_id) in seen {
        let message_id = if sequence == 110 { 12 } else { sequence - 99 };
        assert!(durable_id >= message_id, "ack for {sequence} before id {message_id} was durable");
    }
    assert_eq!(topic.durable_id(), 12);

    writer.dispose().await;
    assert_eq!(topic.writer_count(), 0);
    broker.stop().await;
}

#[tokio::test]
async fn failing_ack_handler_disposes_the_writer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    let handler = ack_handler(|_| async { Err(anyhow::anyhow!("producer gone")) });
    let writer = topic
        .create_writer(Some(handler), fast_writer())
        .expect("writer");
    writer
        .write(WriteRequest {
            sequence_number: 1,
            payload: Bytes::from_static(b"m"),
        })
        .expect("write");

    wait_until(|| writer.is_disposed()).await;
    assert!(matches!(
        writer.write(WriteRequest {
            sequence_number: 2,
            payload: Bytes::from_static(b"n"),
        }),
        Err(BrokerError::WriterDisposed)
    ));
    wait_until(|| topic.writer_count() == 0).await;
    broker.stop().await;
}

#[tokio::test]
async fn new_subscription_starts_after_the_durable_mark() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    topic
        .write_many(&[Bytes::from_static(b"old-1"), Bytes::from_static(b"old-2")])
        .expect("write");
    wait_until(|| topic.durable_id() == 2).await;

    topic.create_subscription("audit", None).expect("subscription");
    let (handler, received) = collector();
    let subscriber = topic
        .subscribe("audit", handler, fast_subscriber())
        .expect("subscribe");
    topic.write(Bytes::from_static(b"new")).expect("write");

    wait_until(|| subscriber.last_sent_id() == 3).await;
    let received = received.lock().clone();
    assert_eq!(ids(&received), vec![3]);
    assert_eq!(received[0].body, Bytes::from_static(b"new"));
    subscriber.dispose().await;
    broker.stop().await;
}

#[tokio::test]
async fn reconnect_redelivers_after_the_completed_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    topic.create_subscription("s1", None).expect("subscription");
    let (handler, received) = collector();
    let subscriber = topic
        .subscribe("s1", handler, fast_subscriber())
        .expect("subscribe");
    topic
        .write_many(&[
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ])
        .expect("write");

    wait_until(|| subscriber.last_sent_id() == 3).await;
    assert_eq!(ids(&received.lock()), vec![1, 2, 3]);
    subscriber.complete(2).expect("complete");
    subscriber.dispose().await;
    broker.stop().await;

    let broker = Broker::open(options(dir.path())).await.expect("reopen");
    let topic = broker.get_topic("orders").await.expect("restored");
    assert_eq!(topic.completed_message_id("s1").expect("cursor"), 2);
    let (handler, redelivered) = collector();
    let subscriber = topic
        .subscribe("s1", handler, fast_subscriber())
        .expect("resubscribe");
    wait_until(|| subscriber.last_sent_id() == 3).await;
    let redelivered = redelivered.lock().clone();
    assert_eq!(ids(&redelivered), vec![3]);
    assert_eq!(redelivered[0].body, Bytes::from_static(b"c"));
    subscriber.dispose().await;
    broker.stop().await;
}

#[tokio::test]
async fn cleanup_stops_at_the_minimum_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    topic.create_subscription("one", Some(1)).expect("one");
    topic.create_subscription("two", Some(1)).expect("two");
    let payloads: Vec<_> = (0..200).map(|i| Bytes::from(format!("{i}"))).collect();
    topic.write_many(&payloads).expect("write");
    wait_until(|| topic.durable_id() == 200).await;

    let (handler, _) = collector();
    let one = topic
        .subscribe("one", Arc::clone(&handler), fast_subscriber())
        .expect("one");
    let two = topic
        .subscribe("two", handler, fast_subscriber())
        .expect("two");
    one.complete(100).expect("complete");
    two.complete(150).expect("complete");

    wait_until(|| topic.snapshot().start_message_id() == 101).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(topic.snapshot().start_message_id(), 101);
    one.dispose().await;
    two.dispose().await;
    broker.stop().await;

    // Released messages stay released across a restart.
    let broker = Broker::open(options(dir.path())).await.expect("reopen");
    let topic = broker.get_topic("orders").await.expect("restored");
    let first = topic.snapshot().iter().next().map(|m| m.id).expect("retained");
    assert!(first <= 101, "message 101 was lost (first retained {first})");
    assert_eq!(topic.last_message_id(), 200);
    broker.stop().await;
}

#[tokio::test]
async fn second_subscriber_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    topic.create_subscription("audit", None).expect("subscription");
    let (handler, _) = collector();
    let first = topic
        .subscribe("audit", Arc::clone(&handler), fast_subscriber())
        .expect("subscribe");
    assert!(matches!(
        topic.subscribe("audit", handler, fast_subscriber()),
        Err(BrokerError::SubscriptionInUse { .. })
    ));
    first.dispose().await;
    broker.stop().await;
}

#[tokio::test]
async fn topic_management() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::open(options(dir.path())).await.expect("open");
    let topic = broker.create_topic("orders").await.expect("create");
    broker.create_topic("audit").await.expect("create");
    assert!(matches!(
        broker.create_topic("orders").await,
        Err(BrokerError::TopicExists(_))
    ));
    assert!(matches!(
        broker.create_topic("../escape").await,
        Err(BrokerError::InvalidName(_))
    ));
    assert!(matches!(
        broker.get_topic("missing").await,
        Err(BrokerError::TopicNotFound(_))
    ));
    assert_eq!(broker.topic_names().await, vec!["audit", "orders"]);

    topic.create_subscription("keep", None).expect("subscription");
    assert!(matches!(
        broker.delete_topic("orders", false).await,
        Err(BrokerError::SubscriptionsRemain { count: 1, .. })
    ));
    assert!(broker.topic_exists("orders").await);

    broker.delete_topic("orders", true).await.expect("delete");
    assert!(!broker.topic_exists("orders").await);
    assert!(!dir.path().join("orders").exists());
    broker.stop().await;

    let broker = Broker::open(options(dir.path())).await.expect("reopen");
    assert_eq!(broker.topic_names().await, vec!["audit"]);
    broker.stop().await;
}
