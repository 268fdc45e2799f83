//! Pull-style message receiver.
//!
//! A [`MessageReceiver`] has no pump: the caller decides when to receive and
//! how to settle. Every operation runs under the receiver's retry policy.

use crate::client::QueueProvider;
use crate::error::{LifecycleError, QueueError};
use crate::message::{LockToken, QueueName, ReceivedMessage};
use crate::provider::ReceiveMode;
use crate::retry::{execute_with_retry, RetryPolicy};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Receiver bound to one queue and one receive mode
pub struct MessageReceiver {
    provider: Arc<dyn QueueProvider>,
    queue_name: QueueName,
    receive_mode: ReceiveMode,
    retry_policy: RetryPolicy,
    closed: AtomicBool,
}

impl MessageReceiver {
    pub fn new(
        provider: Arc<dyn QueueProvider>,
        receive_mode: ReceiveMode,
        retry_policy: RetryPolicy,
    ) -> Self {
        let queue_name = provider.entity_path().clone();
        Self {
            provider,
            queue_name,
            receive_mode,
            retry_policy,
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Lifecycle(LifecycleError::ClientClosed {
                queue_name: self.queue_name.to_string(),
            }));
        }
        Ok(())
    }

    fn ensure_peek_lock(&self, operation: &str) -> Result<(), QueueError> {
        if self.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(QueueError::InvalidOperation {
                message: format!(
                    "cannot {} on '{}': receiver uses ReceiveAndDelete mode",
                    operation, self.queue_name
                ),
            });
        }
        Ok(())
    }

    /// Wait up to `timeout` for one message
    pub async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        self.ensure_open()?;
        execute_with_retry(&self.retry_policy, "receive", || {
            self.provider.receive(self.receive_mode, timeout)
        })
        .await
    }

    /// Receive up to `max_messages`.
    ///
    /// Waits up to `timeout` for the first message, then collects whatever
    /// else is immediately available.
    pub async fn receive_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.ensure_open()?;
        let mut messages = Vec::with_capacity(max_messages.min(64));
        if max_messages == 0 {
            return Ok(messages);
        }

        let mut wait = timeout;
        while messages.len() < max_messages {
            match self.receive(wait).await? {
                Some(message) => messages.push(message),
                None => break,
            }
            wait = Duration::ZERO;
        }

        debug!(
            queue_name = %self.queue_name,
            received = messages.len(),
            requested = max_messages,
            "Batch received"
        );
        Ok(messages)
    }

    pub async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ensure_peek_lock("complete")?;
        execute_with_retry(&self.retry_policy, "complete", || {
            self.provider.complete(lock_token)
        })
        .await
    }

    pub async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ensure_peek_lock("abandon")?;
        execute_with_retry(&self.retry_policy, "abandon", || {
            self.provider.abandon(lock_token)
        })
        .await
    }

    pub async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ensure_peek_lock("dead-letter")?;
        execute_with_retry(&self.retry_policy, "dead_letter", || {
            self.provider.dead_letter(lock_token, reason)
        })
        .await
    }

    pub async fn renew_lock(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ensure_peek_lock("renew lock")?;
        execute_with_retry(&self.retry_policy, "renew_lock", || {
            self.provider.renew_lock(lock_token)
        })
        .await
    }

    /// Close the link. Closing a closed receiver does nothing.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.provider.close().await?;
        info!(queue_name = %self.queue_name, "Message receiver closed");
        Ok(())
    }
}

impl fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("queue_name", &self.queue_name)
            .field("receive_mode", &self.receive_mode)
            .field("retry_policy", &self.retry_policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}
