//! Integration tests for hosting a handler behind a queue listener
//!
//! These tests verify:
//! - Factory, client and listener compose over the in-memory broker
//! - Auto-complete removes handled messages
//! - Failed messages are redelivered and dead-lettered after the delivery limit
//! - Close waits for in-flight callbacks and releases the client once
//! - Dispatch errors reach the diagnostic sink

mod common;

use bytes::Bytes;
use common::{eventually, queue, RecordingHandler, CONNECTION_STRING};
use queue_bridge::transport::memory::MAX_DELIVERY_COUNT_EXCEEDED;
use queue_bridge::{
    CommunicationListener, DispatchAction, InMemoryBroker, InMemoryConfig, LifecycleError,
    ListenerState, MemoryDiagnosticSink, Message, MessageHandlerOptions, QueueClientFactory,
    QueueError, QueueListener, ReceiveMode, TransportType,
};
use std::sync::Arc;
use std::time::Duration;

fn factory(broker: &InMemoryBroker) -> QueueClientFactory {
    QueueClientFactory::new(CONNECTION_STRING, TransportType::Amqp, Arc::new(broker.clone()))
}

fn options() -> MessageHandlerOptions {
    MessageHandlerOptions::default().with_receive_timeout(Duration::from_millis(50))
}

fn text(body: &str) -> Message {
    Message::new(Bytes::from(body.to_string()))
}

/// Verify that every message sent after open reaches the handler in order
#[tokio::test]
async fn test_listener_delivers_in_order_and_auto_completes() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let client = factory(&broker)
        .get_queue_client("orders", ReceiveMode::PeekLock)
        .unwrap();
    let listener = QueueListener::new(client, recorder.handler(), options().with_auto_complete(true));

    listener.open().await.unwrap();
    let sender = factory(&broker)
        .get_queue_client("orders", ReceiveMode::PeekLock)
        .unwrap();
    for i in 0..5 {
        sender.send(text(&format!("order-{}", i))).await.unwrap();
    }

    assert!(eventually(|| recorder.count() == 5).await);
    assert!(eventually(|| broker.locked_message_count(&queue("orders")) == 0).await);
    assert_eq!(
        recorder.bodies(),
        vec!["order-0", "order-1", "order-2", "order-3", "order-4"]
    );
    assert_eq!(broker.active_message_count(&queue("orders")), 0);

    listener.close().await.unwrap();
    sender.close().await.unwrap();
}

/// Verify that a message whose handler keeps failing ends up dead-lettered
#[tokio::test]
async fn test_failing_handler_dead_letters_after_delivery_limit() {
    let broker = InMemoryBroker::new(InMemoryConfig {
        max_delivery_count: 3,
        ..Default::default()
    });
    let recorder = RecordingHandler::new();
    let sink = Arc::new(MemoryDiagnosticSink::new());
    let client = factory(&broker)
        .get_queue_client_with_backoff("orders", ReceiveMode::PeekLock, 0.0, 0.0, 0)
        .unwrap();
    let listener = QueueListener::new(
        client,
        recorder.failing_handler(),
        options()
            .with_auto_complete(true)
            .with_diagnostic_sink(sink.clone()),
    );
    broker.send(&queue("orders"), &text("poison")).unwrap();

    listener.open().await.unwrap();

    assert!(eventually(|| broker.dead_letter_messages(&queue("orders")).len() == 1).await);
    listener.close().await.unwrap();

    assert_eq!(recorder.count(), 3);
    let deliveries: Vec<u32> = recorder.messages().iter().map(|m| m.delivery_count).collect();
    assert_eq!(deliveries, vec![1, 2, 3]);
    let dead = broker.dead_letter_messages(&queue("orders"));
    assert_eq!(
        dead[0].properties.get("DeadLetterReason").map(String::as_str),
        Some(MAX_DELIVERY_COUNT_EXCEEDED)
    );
    assert_eq!(sink.events_for(DispatchAction::UserCallback).len(), 3);
}

/// Verify that a failing handler without auto-complete leaves the message locked
#[tokio::test]
async fn test_failing_handler_without_auto_complete_keeps_lock() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let sink = Arc::new(MemoryDiagnosticSink::new());
    let client = factory(&broker)
        .get_queue_client("orders", ReceiveMode::PeekLock)
        .unwrap();
    let listener = QueueListener::new(
        client,
        recorder.failing_handler(),
        options().with_diagnostic_sink(sink.clone()),
    );
    broker.send(&queue("orders"), &text("kept")).unwrap();

    listener.open().await.unwrap();
    assert!(eventually(|| sink.events_for(DispatchAction::UserCallback).len() == 1).await);
    listener.close().await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert_eq!(broker.locked_message_count(&queue("orders")), 1);
}

/// Verify that receive-and-delete delivery removes messages without settlement
#[tokio::test]
async fn test_receive_and_delete_listener() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let client = factory(&broker)
        .get_queue_client("orders", ReceiveMode::ReceiveAndDelete)
        .unwrap();
    let listener = QueueListener::new(client, recorder.handler(), options().with_auto_complete(true));
    for i in 0..3 {
        broker.send(&queue("orders"), &text(&i.to_string())).unwrap();
    }

    listener.open().await.unwrap();

    assert!(eventually(|| recorder.count() == 3).await);
    assert!(recorder.messages().iter().all(|m| m.lock_token.is_none()));
    assert_eq!(broker.locked_message_count(&queue("orders")), 0);
    listener.close().await.unwrap();
}

/// Verify the listener state machine across open, close and reopen
#[tokio::test]
async fn test_listener_lifecycle_rules() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let client = factory(&broker)
        .get_queue_client("orders", ReceiveMode::PeekLock)
        .unwrap();
    let listener = QueueListener::new(client, recorder.handler(), options());

    assert_eq!(listener.state(), ListenerState::Created);
    assert_eq!(listener.open().await.unwrap(), "orders");
    assert!(matches!(
        listener.open().await,
        Err(QueueError::Lifecycle(LifecycleError::AlreadyOpen { .. }))
    ));

    listener.close().await.unwrap();
    listener.close().await.unwrap();
    listener.abort();

    assert_eq!(listener.state(), ListenerState::Closed);
    assert!(matches!(
        listener.open().await,
        Err(QueueError::Lifecycle(LifecycleError::Closed { .. }))
    ));
}

/// Verify that two listeners on one queue share its messages without duplicates
#[tokio::test]
async fn test_competing_listeners_share_the_queue() {
    let broker = InMemoryBroker::default();
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let listeners = [
        QueueListener::new(
            factory(&broker).get_queue_client("orders", ReceiveMode::PeekLock).unwrap(),
            first.handler(),
            options().with_auto_complete(true),
        ),
        QueueListener::new(
            factory(&broker).get_queue_client("orders", ReceiveMode::PeekLock).unwrap(),
            second.handler(),
            options().with_auto_complete(true),
        ),
    ];
    for listener in &listeners {
        listener.open().await.unwrap();
    }

    for i in 0..20 {
        broker.send(&queue("orders"), &text(&i.to_string())).unwrap();
    }

    assert!(eventually(|| first.count() + second.count() == 20).await);
    for listener in &listeners {
        listener.close().await.unwrap();
    }

    let mut all: Vec<String> = first.bodies().into_iter().chain(second.bodies()).collect();
    all.sort_by_key(|body| body.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(all, expected);
}

/// Verify that transient broker faults are absorbed and delivery continues
#[tokio::test]
async fn test_transient_faults_do_not_stop_delivery() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let sink = Arc::new(MemoryDiagnosticSink::new());
    let client = factory(&broker)
        .get_queue_client_with_backoff("orders", ReceiveMode::PeekLock, 0.0, 0.01, 5)
        .unwrap();
    let listener = QueueListener::new(
        client,
        recorder.handler(),
        options()
            .with_auto_complete(true)
            .with_diagnostic_sink(sink.clone()),
    );
    for _ in 0..2 {
        broker
            .inject_receive_error(
                &queue("orders"),
                QueueError::Timeout {
                    duration: Duration::from_secs(1),
                },
            )
            .unwrap();
    }
    broker.send(&queue("orders"), &text("after faults")).unwrap();

    listener.open().await.unwrap();

    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(sink.events_for(DispatchAction::Receive).len(), 2);
    listener.close().await.unwrap();
}

/// Verify that a faulted client is still released by the listener
#[tokio::test]
async fn test_terminal_fault_then_close() {
    let broker = InMemoryBroker::default();
    let recorder = RecordingHandler::new();
    let sink = Arc::new(MemoryDiagnosticSink::new());
    let client = factory(&broker)
        .get_queue_client("orders", ReceiveMode::PeekLock)
        .unwrap();
    let listener = QueueListener::new(
        client,
        recorder.handler(),
        options().with_diagnostic_sink(sink.clone()),
    );
    broker
        .inject_receive_error(
            &queue("orders"),
            QueueError::QueueNotFound {
                queue_name: "orders".to_string(),
            },
        )
        .unwrap();

    listener.open().await.unwrap();

    assert!(eventually(|| !sink.events_for(DispatchAction::Receive).is_empty()).await);
    listener.close().await.unwrap();
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(recorder.count(), 0);
}
