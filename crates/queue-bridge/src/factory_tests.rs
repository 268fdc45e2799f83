//! Tests for the queue client factory.

use super::*;
use crate::message::Message;
use crate::transport::memory::InMemoryBroker;
use bytes::Bytes;
use std::time::Duration;

const CONNECTION_STRING: &str =
    "Endpoint=sb://orders.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=abc123";

fn memory_factory(broker: &InMemoryBroker, transport: TransportType) -> QueueClientFactory {
    QueueClientFactory::new(CONNECTION_STRING, transport, Arc::new(broker.clone()))
}

mod construction {
    use super::*;

    #[test]
    fn test_default_client_carries_default_retry_policy() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let client = factory
            .get_queue_client("orders", ReceiveMode::PeekLock)
            .unwrap();

        assert_eq!(client.queue_name().as_str(), "orders");
        assert_eq!(client.receive_mode(), ReceiveMode::PeekLock);
        assert_eq!(client.retry_policy(), RetryPolicy::default());
        assert!(!client.is_closed_or_closing());
    }

    #[test]
    fn test_backoff_arguments_become_retry_policy() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::AmqpWebSockets);

        let client = factory
            .get_queue_client_with_backoff("orders", ReceiveMode::ReceiveAndDelete, 1.0, 8.0, 3)
            .unwrap();

        let policy = client.retry_policy();
        assert_eq!(policy.minimum_backoff(), Duration::from_secs(1));
        assert_eq!(policy.maximum_backoff(), Duration::from_secs(8));
        assert_eq!(policy.maximum_retry_count(), 3);
        assert_eq!(client.receive_mode(), ReceiveMode::ReceiveAndDelete);
    }

    #[test]
    fn test_explicit_retry_policy_is_used_unchanged() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);
        let policy = RetryPolicy::no_retry();

        let client = factory
            .get_queue_client_with_retry("orders", ReceiveMode::PeekLock, policy)
            .unwrap();

        assert_eq!(client.retry_policy(), policy);
    }

    #[test]
    fn test_message_receiver_bound_to_queue() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let receiver = factory
            .get_message_receiver("orders", ReceiveMode::PeekLock)
            .unwrap();

        assert_eq!(receiver.queue_name().as_str(), "orders");
        assert_eq!(receiver.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_construction_does_not_create_queue() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let _client = factory
            .get_queue_client("orders", ReceiveMode::PeekLock)
            .unwrap();

        assert!(!broker.queue_exists(&QueueName::new("orders".to_string()).unwrap()));
    }

    #[tokio::test]
    async fn test_clients_from_one_factory_share_the_namespace() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);
        let sender = factory
            .get_queue_client("orders", ReceiveMode::PeekLock)
            .unwrap();
        let receiver = factory
            .get_message_receiver("orders", ReceiveMode::ReceiveAndDelete)
            .unwrap();

        sender
            .send(Message::new(Bytes::from("hello")))
            .await
            .unwrap();
        let received = receiver.receive(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(received.body_as_str().unwrap(), "hello");
    }
}

mod configuration_errors {
    use super::*;

    #[test]
    fn test_missing_key_reports_field_and_match_count() {
        let broker = InMemoryBroker::default();
        let factory = QueueClientFactory::new(
            "Endpoint=sb://orders.servicebus.windows.net/;SharedAccessKeyName=Root",
            TransportType::Amqp,
            Arc::new(broker),
        );

        let error = factory
            .get_queue_client("orders", ReceiveMode::PeekLock)
            .err()
            .unwrap();

        match error {
            QueueError::Configuration(ConfigurationError::ConnectionStringKey { key, matches }) => {
                assert_eq!(key, "SharedAccessKey");
                assert_eq!(matches, 0);
            }
            other => panic!("Expected ConnectionStringKey, got: {:?}", other),
        }
    }

    #[test]
    fn test_repeated_key_name_reports_two_matches() {
        let broker = InMemoryBroker::default();
        let factory = QueueClientFactory::new(
            "Endpoint=sb://x.servicebus.windows.net/;SharedAccessKeyName=RootKey;SharedAccessKeyName=Other;SharedAccessKey=abc123",
            TransportType::Amqp,
            Arc::new(broker),
        );

        let error = factory
            .get_queue_client("orders", ReceiveMode::PeekLock)
            .err()
            .unwrap();

        match error {
            QueueError::Configuration(ConfigurationError::ConnectionStringKey { key, matches }) => {
                assert_eq!(key, "SharedAccessKeyName");
                assert_eq!(matches, 2);
            }
            other => panic!("Expected ConnectionStringKey, got: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_backoff_is_configuration_error() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let result =
            factory.get_queue_client_with_backoff("orders", ReceiveMode::PeekLock, 30.0, 5.0, 10);

        assert!(matches!(
            result.err(),
            Some(QueueError::Configuration(
                ConfigurationError::InvalidRetryPolicy { .. }
            ))
        ));
    }

    #[test]
    fn test_invalid_queue_name_is_validation_error() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let result = factory.get_queue_client("-orders", ReceiveMode::PeekLock);

        assert!(matches!(result.err(), Some(QueueError::Validation(_))));
    }

    #[test]
    fn test_entity_path_must_match_requested_queue() {
        let broker = InMemoryBroker::default();
        let factory = QueueClientFactory::new(
            format!("{};EntityPath=invoices", CONNECTION_STRING),
            TransportType::Amqp,
            Arc::new(broker),
        );

        assert!(factory
            .get_queue_client("invoices", ReceiveMode::PeekLock)
            .is_ok());
        assert!(matches!(
            factory
                .get_queue_client("orders", ReceiveMode::PeekLock)
                .err(),
            Some(QueueError::Configuration(ConfigurationError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_http_factory_rejects_amqp_transport() {
        let factory = QueueClientFactory::new(
            CONNECTION_STRING,
            TransportType::Amqp,
            Arc::new(HttpTransportConnector::new()),
        );

        let result = factory.get_queue_client("orders", ReceiveMode::PeekLock);

        assert!(matches!(
            result.err(),
            Some(QueueError::Configuration(
                ConfigurationError::UnsupportedTransport { .. }
            ))
        ));
    }

    #[test]
    fn test_http_factory_builds_https_client_without_io() {
        let factory = QueueClientFactory::with_http(CONNECTION_STRING);

        let client = factory.get_queue_client("orders", ReceiveMode::PeekLock);

        assert!(client.is_ok());
        assert_eq!(factory.transport(), TransportType::Https);
    }

    #[test]
    fn test_debug_redacts_connection_string() {
        let broker = InMemoryBroker::default();
        let factory = memory_factory(&broker, TransportType::Amqp);

        let debug = format!("{:?}", factory);

        assert!(!debug.contains("abc123"));
        assert!(debug.contains("<redacted>"));
    }
}
