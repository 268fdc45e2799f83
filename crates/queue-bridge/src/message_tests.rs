//! Tests for message types.

use super::*;

fn received(body: &'static str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId::new(),
        body: Bytes::from(body),
        properties: HashMap::new(),
        content_type: None,
        correlation_id: Some("corr-123".to_string()),
        label: None,
        sequence_number: 1,
        delivery_count: 1,
        enqueued_at: Some(Timestamp::now()),
        locked_until: None,
        lock_token: None,
    }
}

#[test]
fn test_queue_name_accepts_service_bus_names() {
    assert!(QueueName::new("orders".to_string()).is_ok());
    assert!(QueueName::new("orders.v2_high-priority".to_string()).is_ok());
    assert!(QueueName::new("tenant/orders".to_string()).is_ok());
}

#[test]
fn test_queue_name_rejects_invalid_names() {
    assert!(QueueName::new(String::new()).is_err());
    assert!(QueueName::new("a".repeat(261)).is_err());
    assert!(QueueName::new("orders!".to_string()).is_err());
    assert!(QueueName::new("-orders".to_string()).is_err());
    assert!(QueueName::new("orders/".to_string()).is_err());
}

#[test]
fn test_message_builder() {
    let message = Message::new(Bytes::from("test body"))
        .with_property("key".to_string(), "value".to_string())
        .with_correlation_id("corr-123".to_string())
        .with_label("order-created".to_string())
        .with_ttl(Duration::minutes(30));

    assert_eq!(message.properties.get("key"), Some(&"value".to_string()));
    assert_eq!(message.correlation_id, Some("corr-123".to_string()));
    assert_eq!(message.label, Some("order-created".to_string()));
    assert_eq!(message.time_to_live, Some(Duration::minutes(30)));
}

#[test]
fn test_message_ids_are_unique() {
    let first = Message::new(Bytes::from("a"));
    let second = Message::new(Bytes::from("a"));

    assert_ne!(first.message_id, second.message_id);
}

#[test]
fn test_json_message_round_trips_through_received_body() {
    let message = Message::from_json(&serde_json::json!({ "order": 42 })).unwrap();
    assert_eq!(message.content_type.as_deref(), Some("application/json"));

    let mut incoming = received("");
    incoming.body = message.body.clone();
    let value: serde_json::Value = incoming.body_json().unwrap();
    assert_eq!(value["order"], 42);
}

#[test]
fn test_body_as_str_rejects_invalid_utf8() {
    let mut incoming = received("");
    incoming.body = Bytes::from_static(&[0xff, 0xfe]);

    assert!(matches!(
        incoming.body_as_str(),
        Err(QueueError::Validation(_))
    ));
}

#[test]
fn test_received_message_to_message() {
    let incoming = received("payload");

    let message = incoming.message();
    assert_eq!(message.message_id, incoming.message_id);
    assert_eq!(message.correlation_id, Some("corr-123".to_string()));
    assert_eq!(message.time_to_live, None); // TTL not preserved
}

#[test]
fn test_lock_expiry() {
    let mut incoming = received("payload");
    assert!(!incoming.is_lock_expired());

    incoming.locked_until = Some(Timestamp::now().add(Duration::minutes(5)));
    assert!(!incoming.is_lock_expired());

    incoming.locked_until = Some(Timestamp::now().add(Duration::seconds(-1)));
    assert!(incoming.is_lock_expired());
}
