//! Unit tests for the in-process broker.

use serde_json::json;
use std::time::Duration;

use crate::broker::MessageBus;
use crate::error::BusError;

// ── publish / subscribe ─────────────────────────────────────────────

#[tokio::test]
async fn subscriber_receives_published_message() {
    let bus = MessageBus::new();
    let mut sub = bus.subscribe("test.channel").unwrap();

    let delivered = bus.publish("test.channel", json!({"data": "hello"})).unwrap();
    assert_eq!(delivered, 1);

    let envelope = sub.recv().await.expect("should receive message");
    assert_eq!(envelope.topic, "test.channel");
    assert_eq!(envelope.payload["data"], "hello");
}

#[tokio::test]
async fn publish_without_subscribers_is_not_an_error() {
    let bus = MessageBus::new();
    assert_eq!(bus.publish("nobody.listens", json!({})).unwrap(), 0);
}

#[tokio::test]
async fn every_subscriber_gets_a_copy() {
    let bus = MessageBus::new();
    let mut a = bus.subscribe("fanout").unwrap();
    let mut b = bus.subscribe("fanout").unwrap();

    assert_eq!(bus.publish("fanout", json!({"n": 1})).unwrap(), 2);
    assert_eq!(a.recv().await.unwrap().payload["n"], 1);
    assert_eq!(b.recv().await.unwrap().payload["n"], 1);
}

#[tokio::test]
async fn per_topic_delivery_is_fifo() {
    let bus = MessageBus::new();
    let mut sub = bus.subscribe("ordered").unwrap();

    for n in 0..50 {
        bus.publish("ordered", json!({"n": n})).unwrap();
    }
    for n in 0..50 {
        assert_eq!(sub.recv().await.unwrap().payload["n"], n);
    }
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = MessageBus::new();
    let mut sub = bus.subscribe("a").unwrap();

    bus.publish("b", json!({"x": 1})).unwrap();
    assert!(sub.try_recv().is_none());
}

#[test]
fn rejects_empty_topic_and_non_object_payload() {
    let bus = MessageBus::new();

    assert!(matches!(
        bus.publish("  ", json!({})),
        Err(BusError::InvalidTopic(_))
    ));
    assert!(matches!(
        bus.publish("t", json!([1, 2, 3])),
        Err(BusError::InvalidPayload { .. })
    ));
    assert!(matches!(bus.subscribe(""), Err(BusError::InvalidTopic(_))));
}

// ── retained topics ─────────────────────────────────────────────────

#[tokio::test]
async fn retained_value_is_replayed_to_late_subscribers() {
    let bus = MessageBus::new();
    bus.publish_retained("registry", json!({"v": 1})).unwrap();
    bus.publish_retained("registry", json!({"v": 2})).unwrap();

    let mut late = bus.subscribe("registry").unwrap();
    assert_eq!(late.recv().await.unwrap().payload["v"], 2);
    assert!(late.try_recv().is_none());
    assert_eq!(bus.retained("registry").unwrap()["v"], 2);
}

#[test]
fn plain_publish_does_not_retain() {
    let bus = MessageBus::new();
    bus.publish("plain", json!({"v": 1})).unwrap();
    assert!(bus.retained("plain").is_none());
}

// ── lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn dropping_subscription_unregisters_it() {
    let bus = MessageBus::new();
    let sub = bus.subscribe("t").unwrap();
    assert_eq!(bus.subscriber_count("t"), 1);

    drop(sub);
    assert_eq!(bus.subscriber_count("t"), 0);
    assert_eq!(bus.publish("t", json!({})).unwrap(), 0);
}

#[tokio::test]
async fn shutdown_ends_streams_and_rejects_publishes() {
    let bus = MessageBus::new();
    let mut sub = bus.subscribe("t").unwrap();
    bus.publish("t", json!({"last": true})).unwrap();

    bus.shutdown();
    bus.shutdown();

    assert_eq!(sub.recv().await.unwrap().payload["last"], true);
    assert!(sub.recv().await.is_none());
    assert!(matches!(bus.publish("t", json!({})), Err(BusError::Closed)));
    assert!(matches!(bus.subscribe("t"), Err(BusError::Closed)));
}

#[tokio::test]
async fn listener_runs_handler_for_each_message() {
    let bus = MessageBus::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let listener = bus
        .listen("events", move |envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope.payload["n"].as_i64().unwrap_or_default());
            }
        })
        .unwrap();

    bus.publish("events", json!({"n": 7})).unwrap();
    bus.publish("events", json!({"n": 8})).unwrap();

    assert_eq!(rx.recv().await, Some(7));
    assert_eq!(rx.recv().await, Some(8));

    drop(listener);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.subscriber_count("events"), 0);
}
