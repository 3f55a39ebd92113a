// tests/broker_memory.rs

//! Contract tests for the in-memory reference broker.

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use queue_rpc::{
    // ---
    Address,
    Broker,
    CorrelationId,
    Envelope,
    Error,
    MemoryBroker,
    QueueSpec,
};

fn request_to(queue: &str, payload: &'static [u8]) -> Envelope {
    Envelope::request(
        Address::from(queue),
        Bytes::from_static(payload),
        CorrelationId::generate(),
        Address::from("reply.nowhere"),
        "text/plain",
    )
}

#[tokio::test]
async fn declare_publish_subscribe_delivers() {
    // ---
    let broker = MemoryBroker::create();

    let queue = broker
        .declare_queue(QueueSpec::work("work", false))
        .await
        .expect("declare failed");

    // Published before any consumer: buffered, not lost.
    broker
        .publish(&queue.name, request_to("work", b"hello"))
        .await
        .expect("publish failed");

    let mut stream = broker.subscribe(&queue, false).await.expect("subscribe failed");

    let delivery = timeout(Duration::from_millis(100), stream.inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery stream closed unexpectedly");

    assert_eq!(&delivery.envelope.payload[..], b"hello");
    assert_eq!(delivery.envelope.address, queue.name);
    assert!(delivery.envelope.correlation_id.is_some());

    delivery.ack().await.expect("ack failed");
    assert_eq!(broker.stats().acked, 1);
}

#[tokio::test]
async fn publish_to_undeclared_queue_is_an_error() {
    // ---
    let broker = MemoryBroker::create();

    let outcome = broker
        .publish(&Address::from("nowhere"), request_to("nowhere", b"x"))
        .await;

    assert!(matches!(outcome, Err(Error::Publish(_))));
    assert_eq!(broker.stats().published, 0);
}

#[tokio::test]
async fn reject_with_requeue_redelivers() {
    // ---
    let broker = MemoryBroker::create();
    let queue = broker
        .declare_queue(QueueSpec::work("work", false))
        .await
        .unwrap();

    broker
        .publish(&queue.name, request_to("work", b"again"))
        .await
        .unwrap();

    let mut stream = broker.subscribe(&queue, false).await.unwrap();

    let first = stream.inbox.recv().await.expect("no first delivery");
    first.reject(true).await.expect("requeue failed");

    // The same envelope comes around again.
    let second = timeout(Duration::from_millis(100), stream.inbox.recv())
        .await
        .expect("timed out waiting for redelivery")
        .expect("stream closed");
    assert_eq!(&second.envelope.payload[..], b"again");

    second.reject(false).await.expect("reject failed");

    let stats = broker.stats();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn second_subscriber_on_one_queue_is_refused() {
    // ---
    let broker = MemoryBroker::create();
    let queue = broker
        .declare_queue(QueueSpec::reply("reply.one"))
        .await
        .unwrap();

    let _stream = broker.subscribe(&queue, true).await.unwrap();
    let second = broker.subscribe(&queue, true).await;

    assert!(matches!(second, Err(Error::Broker(_))));
}

#[tokio::test]
async fn auto_ack_deliveries_carry_no_obligation() {
    // ---
    let broker = MemoryBroker::create();
    let queue = broker
        .declare_queue(QueueSpec::reply("reply.two"))
        .await
        .unwrap();

    let mut stream = broker.subscribe(&queue, true).await.unwrap();

    broker
        .publish(&queue.name, request_to("reply.two", b"fire-and-forget"))
        .await
        .unwrap();

    let delivery = timeout(Duration::from_millis(100), stream.inbox.recv())
        .await
        .expect("timed out")
        .expect("stream closed");

    // Dropping the delivery unresolved is fine for auto-ack.
    drop(delivery);

    let stats = broker.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn close_ends_delivery_streams() {
    // ---
    let broker = MemoryBroker::create();
    let queue = broker
        .declare_queue(QueueSpec::work("work", false))
        .await
        .unwrap();

    let mut stream = broker.subscribe(&queue, false).await.unwrap();

    broker.close().await.unwrap();

    let next = timeout(Duration::from_millis(100), stream.inbox.recv())
        .await
        .expect("timed out waiting for stream close");
    assert!(next.is_none());
}
