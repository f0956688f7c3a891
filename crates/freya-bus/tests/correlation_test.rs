//! Correlation layer behaviour under concurrency, timeouts and late replies.

use freya_bus::{CorrelationError, Correlator, MessageBus, REQUEST_ID_FIELD};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const REQUEST: &str = "test.request";
const RESULT: &str = "test.result";

fn payload(n: u64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("n".to_string(), json!(n));
    map
}

/// Echoes every request back on the result topic, in reverse arrival order
/// once `batch` requests have been collected.
fn spawn_reversing_responder(bus: MessageBus, batch: usize) -> tokio::task::JoinHandle<()> {
    let mut requests = bus.subscribe(REQUEST).unwrap();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(envelope) = requests.recv().await {
            seen.push(envelope.payload);
            if seen.len() == batch {
                for request in seen.drain(..).rev() {
                    bus.publish(
                        RESULT,
                        json!({
                            REQUEST_ID_FIELD: request[REQUEST_ID_FIELD],
                            "echo": request["n"],
                        }),
                    )
                    .unwrap();
                }
            }
        }
    })
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_results() {
    let bus = MessageBus::new();
    let correlator = Arc::new(Correlator::new(bus.clone(), RESULT).unwrap());
    let calls = 32;
    let _responder = spawn_reversing_responder(bus.clone(), calls);

    let mut handles = Vec::new();
    for n in 0..calls as u64 {
        let correlator = correlator.clone();
        handles.push(tokio::spawn(async move {
            let result = correlator
                .call(REQUEST, payload(n), Duration::from_secs(5))
                .await
                .expect("call should succeed");
            (n, result)
        }));
    }

    for handle in handles {
        let (n, result) = handle.await.unwrap();
        assert_eq!(result["echo"], json!(n), "call {n} got someone else's result");
    }
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn each_call_publishes_exactly_once_with_fresh_id() {
    let bus = MessageBus::new();
    let correlator = Correlator::new(bus.clone(), RESULT).unwrap();
    let mut requests = bus.subscribe(REQUEST).unwrap();

    let mut stale = payload(1);
    stale.insert(REQUEST_ID_FIELD.to_string(), json!("caller-supplied"));

    let err = correlator
        .call(REQUEST, stale, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let published = requests.try_recv().expect("request should be published");
    assert_ne!(published.payload[REQUEST_ID_FIELD], json!("caller-supplied"));
    assert!(requests.try_recv().is_none(), "only one publish per call");
}

#[tokio::test]
async fn timeout_removes_pending_entry_and_drops_late_result() {
    let bus = MessageBus::new();
    let correlator = Correlator::new(bus.clone(), RESULT).unwrap();

    let err = correlator
        .call(REQUEST, payload(1), Duration::from_millis(20))
        .await
        .unwrap_err();

    let request_id = match err {
        CorrelationError::Timeout { request_id, .. } => request_id,
        other => panic!("expected timeout, got {other:?}"),
    };
    assert!(!correlator.is_pending(&request_id));
    assert_eq!(correlator.pending_count(), 0);

    // A late reply must be ignored without resurrecting anything.
    bus.publish(RESULT, json!({REQUEST_ID_FIELD: request_id, "late": true}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(correlator.pending_count(), 0);

    // The correlator keeps working afterwards.
    let _responder = spawn_reversing_responder(bus.clone(), 1);
    let result = correlator
        .call(REQUEST, payload(2), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!(2));
}

#[tokio::test]
async fn duplicate_results_are_discarded() {
    let bus = MessageBus::new();
    let correlator = Arc::new(Correlator::new(bus.clone(), RESULT).unwrap());
    let mut requests = bus.subscribe(REQUEST).unwrap();

    let caller = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .call(REQUEST, payload(9), Duration::from_secs(1))
                .await
        })
    };

    let request = requests.recv().await.unwrap().payload;
    let id = request[REQUEST_ID_FIELD].clone();
    bus.publish(RESULT, json!({REQUEST_ID_FIELD: id, "copy": 1})).unwrap();
    bus.publish(RESULT, json!({REQUEST_ID_FIELD: id, "copy": 2})).unwrap();

    let result = caller.await.unwrap().unwrap();
    assert_eq!(result["copy"], 1);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn foreign_and_malformed_results_are_ignored() {
    let bus = MessageBus::new();
    let correlator = Correlator::new(bus.clone(), RESULT).unwrap();

    bus.publish(RESULT, json!({"no_id": true})).unwrap();
    bus.publish(RESULT, json!({REQUEST_ID_FIELD: "someone-else"})).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn cancelled_call_cleans_up_its_slot() {
    let bus = MessageBus::new();
    let correlator = Arc::new(Correlator::new(bus.clone(), RESULT).unwrap());

    let task = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .call(REQUEST, payload(1), Duration::from_secs(60))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(correlator.pending_count(), 1);

    task.abort();
    let _ = task.await;
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn publish_failure_leaves_no_pending_entry() {
    let bus = MessageBus::new();
    let correlator = Correlator::new(bus.clone(), RESULT).unwrap();
    bus.shutdown();

    let err = correlator
        .call(REQUEST, payload(1), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert!(matches!(err, CorrelationError::Bus(_)));
    assert_eq!(correlator.pending_count(), 0);
}
