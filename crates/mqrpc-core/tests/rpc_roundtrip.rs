//! Client と worker を InMemoryBroker 上でつないだ end-to-end テスト

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mqrpc_core::config::{TaskRegistryConfig, WorkerConfig};
use mqrpc_core::impls::{InMemoryBroker, JsonCodec};
use mqrpc_core::ports::{Broker, DEFAULT_EXCHANGE, MessageProperties};
use mqrpc_core::{Dispatcher, HandlerError, RpcError, ServiceBuilder, TaskRegistry, TaskRequest};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

const URI: &str = "memory://e2e";

async fn worker(broker: &InMemoryBroker) -> Dispatcher {
    let text = ServiceBuilder::new("Text")
        .typed("echo", |(s,): (String,)| async move { Ok::<_, HandlerError>(s) })
        .unwrap()
        .typed("fail", |(): ()| async move {
            Err::<Value, _>(HandlerError::new("some error"))
        })
        .unwrap()
        .expect_methods(&["echo", "fail"])
        .build()
        .unwrap();

    let timing = ServiceBuilder::new("Timing")
        .typed("slow", |(): ()| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, HandlerError>("slow")
        })
        .unwrap()
        .typed("fast", |(): ()| async move { Ok::<_, HandlerError>("fast") })
        .unwrap()
        .build()
        .unwrap();

    let dispatcher = Dispatcher::new(
        WorkerConfig::new("worker", URI),
        Arc::new(broker.clone()),
        Arc::new(JsonCodec::new()),
    );
    dispatcher.init().await.unwrap();
    dispatcher.register(&text).await.unwrap();
    dispatcher.register(&timing).await.unwrap();
    dispatcher
}

async fn client(broker: &InMemoryBroker, service: &str, method: &str) -> TaskRegistry {
    let config = TaskRegistryConfig::new("client", URI, service, method);
    let registry = TaskRegistry::new(config, Arc::new(broker.clone()), Arc::new(JsonCodec::new()));
    registry.init().await.unwrap();
    registry
}

#[tokio::test]
async fn echo_round_trip() {
    let broker = InMemoryBroker::new();
    let _worker = worker(&broker).await;
    let echo = client(&broker, "Text", "echo").await;

    let task = echo
        .publish(TaskRequest::new(br#"["hello"]"#.to_vec()))
        .await
        .unwrap();
    assert_eq!(task.result.await.unwrap(), json!("hello"));
    assert_eq!(echo.pending_count(), 0);
}

#[tokio::test]
async fn call_encodes_arguments() {
    let broker = InMemoryBroker::new();
    let _worker = worker(&broker).await;
    let echo = client(&broker, "Text", "echo").await;

    let out = echo
        .call(vec![json!("hello")], Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(out, json!("hello"));
}

#[tokio::test(start_paused = true)]
async fn request_without_worker_times_out() {
    let broker = InMemoryBroker::new();
    let echo = client(&broker, "Text", "echo").await;

    let start = Instant::now();
    let task = echo
        .publish(TaskRequest::new(br#"["hello"]"#.to_vec()).with_ttl(Duration::from_millis(50)))
        .await
        .unwrap();
    let err = task.result.await.unwrap_err();

    let elapsed = start.elapsed();
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(150));
    assert_eq!(echo.pending_count(), 0);
}

#[tokio::test]
async fn handler_error_reaches_caller_and_worker_keeps_running() {
    let broker = InMemoryBroker::new();
    let worker = worker(&broker).await;
    let fail = client(&broker, "Text", "fail").await;
    let echo = client(&broker, "Text", "echo").await;

    let err = fail.call(vec![], None).await.unwrap_err();
    assert!(matches!(err, RpcError::Application { status: 500, .. }));
    assert_eq!(err.to_string(), "some error");

    let err = fail.call(vec![], None).await.unwrap_err();
    assert_eq!(err.to_string(), "some error");
    assert_eq!(echo.call(vec![json!("still up")], None).await.unwrap(), json!("still up"));

    let stats = worker.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn unknown_reply_is_dropped_without_side_effects() {
    let broker = InMemoryBroker::new();
    let echo = client(&broker, "Text", "echo").await;

    // worker がいないので pending のまま
    let waiting = echo
        .publish(TaskRequest::new(br#"["x"]"#.to_vec()).with_correlation_id("known"))
        .await
        .unwrap();

    let conn = broker.connect(URI).await.unwrap();
    let channel = conn.open_channel().await.unwrap();
    let props = MessageProperties {
        correlation_id: Some("stranger".into()),
        ..Default::default()
    };
    let body = serde_json::to_vec(&json!({"meta": {"status": 200}, "data": 1})).unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, echo.reply_queue(), body.clone(), props)
        .await
        .unwrap();

    tokio::task::yield_now().await;
    assert_eq!(echo.stats().unmatched_replies, 1);
    assert_eq!(echo.pending_count(), 1);
    assert_eq!(broker.unacked_count(), 0);

    let props = MessageProperties {
        correlation_id: Some("known".into()),
        ..Default::default()
    };
    channel
        .publish(DEFAULT_EXCHANGE, echo.reply_queue(), body, props)
        .await
        .unwrap();
    assert_eq!(waiting.result.await.unwrap(), json!(1));
}

#[tokio::test(start_paused = true)]
async fn replies_resolve_independently_of_publish_order() {
    let broker = InMemoryBroker::new();
    let _worker = worker(&broker).await;
    let slow = client(&broker, "Timing", "slow").await;
    let fast = client(&broker, "Timing", "fast").await;

    let order = Arc::new(Mutex::new(Vec::new()));

    let a = slow.publish(TaskRequest::new(b"[]".to_vec())).await.unwrap();
    let b = fast.publish(TaskRequest::new(b"[]".to_vec())).await.unwrap();

    let order_a = order.clone();
    let wait_a = tokio::spawn(async move {
        let value = a.result.await.unwrap();
        order_a.lock().push("A");
        value
    });
    let order_b = order.clone();
    let wait_b = tokio::spawn(async move {
        let value = b.result.await.unwrap();
        order_b.lock().push("B");
        value
    });

    assert_eq!(wait_a.await.unwrap(), json!("slow"));
    assert_eq!(wait_b.await.unwrap(), json!("fast"));
    assert_eq!(*order.lock(), vec!["B", "A"]);
}

#[tokio::test]
async fn generated_correlation_ids_are_unique() {
    let broker = InMemoryBroker::new();
    let echo = client(&broker, "Text", "echo").await;

    let mut ids = HashSet::new();
    let mut pending = Vec::new();
    for _ in 0..100 {
        let task = echo.publish(TaskRequest::new(b"[]".to_vec())).await.unwrap();
        ids.insert(task.correlation_id.to_string());
        pending.push(task);
    }

    assert_eq!(ids.len(), 100);
    assert_eq!(echo.pending_count(), 100);
}

#[tokio::test]
async fn malformed_request_gets_failure_reply() {
    let broker = InMemoryBroker::new();
    let worker = worker(&broker).await;
    let echo = client(&broker, "Text", "echo").await;

    let task = echo
        .publish(TaskRequest::new(br#"{"not":"an array"}"#.to_vec()))
        .await
        .unwrap();
    let err = task.result.await.unwrap_err();
    assert_eq!(err.to_string(), "Incorrect type of message. Array is expected.");
    assert_eq!(worker.stats().malformed, 1);
    assert_eq!(broker.message_count("Text.echo"), 0);
}
