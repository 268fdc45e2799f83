//! Service lifecycle adapter around a queue client.
//!
//! [`QueueListener`] turns the push-style handler registration of a
//! [`QueueClient`] into the open/close/abort lifecycle a hosting service
//! drives:
//!
//! ```text
//! Created --open--> Open --close/abort--> Closed
//!    |                                      ^
//!    +------------close/abort---------------+
//! ```
//!
//! The listener owns the client until it is closed. Close and abort take the
//! client out under a mutex, so the client is released exactly once no
//! matter how many times or from how many tasks they are called.

use crate::client::QueueClient;
use crate::error::{LifecycleError, QueueError};
use crate::handler::{MessageHandler, MessageHandlerOptions};
use crate::message::QueueName;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

/// Lifecycle contract of a hosted communication listener
#[async_trait]
pub trait CommunicationListener: Send + Sync {
    /// Start listening. Returns the address the listener serves.
    async fn open(&self) -> Result<String, QueueError>;

    /// Stop gracefully, waiting for in-flight work
    async fn close(&self) -> Result<(), QueueError>;

    /// Stop immediately
    fn abort(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Open,
    Closed,
}

struct ListenerInner {
    state: ListenerState,
    client: Option<Box<dyn QueueClient>>,
    // Taken by the first open; a listener registers its handler once
    handler: Option<MessageHandler>,
}

/// Listener that pumps one queue into one message handler
pub struct QueueListener {
    queue_name: QueueName,
    options: MessageHandlerOptions,
    inner: Mutex<ListenerInner>,
}

impl QueueListener {
    pub fn new(
        client: Box<dyn QueueClient>,
        handler: MessageHandler,
        options: MessageHandlerOptions,
    ) -> Self {
        Self {
            queue_name: client.queue_name().clone(),
            options,
            inner: Mutex::new(ListenerInner {
                state: ListenerState::Created,
                client: Some(client),
                handler: Some(handler),
            }),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    pub fn state(&self) -> ListenerState {
        self.lock().state
    }

    pub fn options(&self) -> &MessageHandlerOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, ListenerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the listener closed and hand back the client if this call won
    fn take_client(&self) -> Option<Box<dyn QueueClient>> {
        let mut inner = self.lock();
        inner.state = ListenerState::Closed;
        inner.handler = None;
        inner.client.take()
    }
}

#[async_trait]
impl CommunicationListener for QueueListener {
    async fn open(&self) -> Result<String, QueueError> {
        let mut inner = self.lock();
        match inner.state {
            ListenerState::Open => {
                return Err(LifecycleError::AlreadyOpen {
                    queue_name: self.queue_name.to_string(),
                }
                .into())
            }
            ListenerState::Closed => {
                return Err(LifecycleError::Closed {
                    queue_name: self.queue_name.to_string(),
                }
                .into())
            }
            ListenerState::Created => {}
        }

        let handler = inner.handler.take().ok_or_else(|| LifecycleError::Closed {
            queue_name: self.queue_name.to_string(),
        })?;
        let client = inner.client.as_ref().ok_or_else(|| LifecycleError::Closed {
            queue_name: self.queue_name.to_string(),
        })?;

        if let Err(e) = client.register_message_handler(handler.clone(), self.options.clone()) {
            // Leave the listener openable again
            inner.handler = Some(handler);
            return Err(e);
        }
        inner.state = ListenerState::Open;

        info!(
            queue_name = %self.queue_name,
            max_concurrent_calls = self.options.max_concurrent_calls,
            auto_complete = self.options.auto_complete,
            "Queue listener opened"
        );
        Ok(self.queue_name.to_string())
    }

    async fn close(&self) -> Result<(), QueueError> {
        let Some(client) = self.take_client() else {
            return Ok(());
        };

        let result = if client.is_closed_or_closing() {
            Ok(())
        } else {
            client.close().await
        };

        match &result {
            Ok(()) => info!(queue_name = %self.queue_name, "Queue listener closed"),
            Err(e) => warn!(queue_name = %self.queue_name, error = %e, "Queue listener closed with error"),
        }
        result
    }

    fn abort(&self) {
        let Some(client) = self.take_client() else {
            return;
        };

        if !client.is_closed_or_closing() {
            client.abort();
        }
        info!(queue_name = %self.queue_name, "Queue listener aborted");
    }
}

impl Drop for QueueListener {
    fn drop(&mut self) {
        let open = self.lock().state == ListenerState::Open;
        if open {
            self.abort();
        }
    }
}

impl fmt::Debug for QueueListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueListener")
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}
