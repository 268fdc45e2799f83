//! Common test utilities for queue-bridge integration tests
//!
//! This module provides:
//! - Connection strings for in-memory and mock REST namespaces
//! - A recording message handler
//! - Polling helpers

use queue_bridge::{message_handler, HandlerError, MessageHandler, QueueName, ReceivedMessage};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

pub const CONNECTION_STRING: &str =
    "Endpoint=sb://bridge-tests.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// Connection string whose endpoint is a mock REST server
#[allow(dead_code)]
pub fn connection_string_for(server_uri: &str) -> String {
    format!(
        "Endpoint={}/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0",
        server_uri
    )
}

/// Handler that records every message it sees
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that records then succeeds
    pub fn handler(&self) -> MessageHandler {
        let received = Arc::clone(&self.received);
        message_handler(move |message, _actions, _cancel| {
            let received = Arc::clone(&received);
            async move {
                received.lock().unwrap().push(message);
                Ok::<(), HandlerError>(())
            }
        })
    }

    /// Handler that records then fails
    pub fn failing_handler(&self) -> MessageHandler {
        let received = Arc::clone(&self.received);
        message_handler(move |message, _actions, _cancel| {
            let received = Arc::clone(&received);
            async move {
                received.lock().unwrap().push(message);
                Err::<(), HandlerError>("handler rejected message".into())
            }
        })
    }

    pub fn bodies(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }
}

/// Poll until `condition` holds or five seconds pass
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
