// Console demo that walks through write, acknowledge, deliver, complete and
// restart on an in-process broker.
use anyhow::{Context, Result};
use bytes::Bytes;
use keel_broker::{
    Broker, BrokerOptions, Message, PushHandler, SubscriberOptions, WriteManyRequest,
    WriterOptions, ack_handler, push_handler,
};
use tokio::sync::mpsc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    println!("== Keel Durable Pub/Sub Demo ==");
    println!("Goal: show that acks follow durability and subscribers resume after a restart.");

    let data_dir = std::env::temp_dir().join(format!("keel-demo-{}", std::process::id()));
    println!("Step 1/6: opening a broker in {}.", data_dir.display());
    let broker = Broker::open(BrokerOptions::new(&data_dir)).await?;
    let topic = broker.create_topic("demo-topic").await?;
    topic.create_subscription("demo-sub", None)?;

    println!("Step 2/6: attaching a subscriber.");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let subscriber = topic.subscribe(
        "demo-sub",
        forward_to(event_tx.clone()),
        SubscriberOptions::default(),
    )?;

    println!("Step 3/6: writing three messages and waiting for the ack.");
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let on_ack = ack_handler(move |ack| {
        let _ = ack_tx.send(ack.sequence_number);
        async { Ok(()) }
    });
    let writer = topic.create_writer(Some(on_ack), WriterOptions::default())?;
    writer.write_many(WriteManyRequest {
        sequence_number: 1,
        payloads: vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ],
    })?;
    let acked = tokio::time::timeout(Duration::from_secs(2), ack_rx.recv())
        .await
        .context("ack timed out")?;
    println!("Ack received for sequence {acked:?} (durable id {}).", topic.durable_id());

    println!("Step 4/6: receiving deliveries and completing message 2.");
    let mut seen = 0;
    while seen < 3 {
        let batch = recv_batch(&mut event_rx).await?;
        seen += batch.len();
    }
    subscriber.complete(2)?;
    subscriber.dispose().await;
    writer.dispose().await;

    println!("Step 5/6: restarting the broker.");
    broker.stop().await;
    let broker = Broker::open(BrokerOptions::new(&data_dir)).await?;
    let topic = broker.get_topic("demo-topic").await?;

    println!("Step 6/6: resubscribing; only the uncompleted tail comes back.");
    let subscriber = topic.subscribe(
        "demo-sub",
        forward_to(event_tx),
        SubscriberOptions::default(),
    )?;
    recv_batch(&mut event_rx).await?;
    subscriber.dispose().await;
    broker.stop().await;

    std::fs::remove_dir_all(&data_dir).context("remove demo data")?;
    println!("Demo complete.");
    Ok(())
}

fn forward_to(events: mpsc::UnboundedSender<Vec<Message>>) -> PushHandler {
    push_handler(move |batch| {
        let _ = events.send(batch);
        async { Ok(()) }
    })
}

async fn recv_batch(events: &mut mpsc::UnboundedReceiver<Vec<Message>>) -> Result<Vec<Message>> {
    let batch = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .context("delivery timed out")?
        .context("subscriber closed")?;
    for message in &batch {
        println!(
            "  delivered id={} body={}",
            message.id,
            String::from_utf8_lossy(&message.body)
        );
    }
    Ok(batch)
}
