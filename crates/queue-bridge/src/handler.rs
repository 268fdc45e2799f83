//! Message handler types and registration options.
//!
//! A handler is an async callback invoked once per delivered message. It
//! receives the message, a [`MessageActions`] handle for explicit settlement
//! and a [`CancellationToken`] that fires when the pump stops.

use crate::client::QueueProvider;
use crate::diagnostics::{DiagnosticSink, TracingDiagnosticSink};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{LockToken, ReceivedMessage};
use crate::retry::{execute_with_retry, RetryPolicy};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

/// Error returned by a message handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a message handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Callback invoked by the dispatch pump for every delivered message
pub type MessageHandler =
    Arc<dyn Fn(ReceivedMessage, MessageActions, CancellationToken) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
///
/// # Example
///
/// ```
/// use queue_bridge::handler::message_handler;
///
/// let handler = message_handler(|message, actions, _cancel| async move {
///     println!("received {}", message.message_id);
///     actions.complete().await?;
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn message_handler<F, Fut>(callback: F) -> MessageHandler
where
    F: Fn(ReceivedMessage, MessageActions, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message, actions, cancellation| Box::pin(callback(message, actions, cancellation)))
}

/// Default receive wait for a single pump iteration
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest wait a single receive call may be configured with
pub const MAX_RECEIVE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Options applied when registering a handler with a client
#[derive(Clone)]
pub struct MessageHandlerOptions {
    /// Upper bound on concurrently running callbacks. 1 keeps strict ordering.
    pub max_concurrent_calls: usize,
    /// Complete on success and abandon on failure (peek-lock only)
    pub auto_complete: bool,
    /// How long one receive call may wait for a message
    pub receive_timeout: Duration,
    /// Where pump errors are reported
    pub diagnostic_sink: Arc<dyn DiagnosticSink>,
}

impl Default for MessageHandlerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: false,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            diagnostic_sink: Arc::new(TracingDiagnosticSink),
        }
    }
}

impl MessageHandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    pub fn with_diagnostic_sink(mut self, diagnostic_sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostic_sink = diagnostic_sink;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrent_calls must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_calls > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_concurrent_calls must not exceed {}",
                    tokio::sync::Semaphore::MAX_PERMITS
                ),
            });
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "receive_timeout must be greater than zero".to_string(),
            });
        }
        if self.receive_timeout > MAX_RECEIVE_TIMEOUT {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "receive_timeout must not exceed {} seconds",
                    MAX_RECEIVE_TIMEOUT.as_secs()
                ),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for MessageHandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandlerOptions")
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("auto_complete", &self.auto_complete)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

/// Settlement operations for one delivered message.
///
/// A message can be settled once. Messages received in ReceiveAndDelete mode
/// carry no lock token and cannot be settled at all.
#[derive(Clone)]
pub struct MessageActions {
    provider: Arc<dyn QueueProvider>,
    retry_policy: RetryPolicy,
    lock_token: Option<LockToken>,
    settled: Arc<AtomicBool>,
}

impl MessageActions {
    pub(crate) fn new(
        provider: Arc<dyn QueueProvider>,
        retry_policy: RetryPolicy,
        lock_token: Option<LockToken>,
    ) -> Self {
        Self {
            provider,
            retry_policy,
            lock_token,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether complete, abandon or dead-letter has succeeded
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn lock_token(&self) -> Option<&LockToken> {
        self.lock_token.as_ref()
    }

    /// Remove the message from the queue
    pub async fn complete(&self) -> Result<(), QueueError> {
        let lock_token = self.begin_settlement("complete")?;
        let result = execute_with_retry(&self.retry_policy, "complete", || {
            self.provider.complete(lock_token)
        })
        .await;
        self.finish_settlement(result)
    }

    /// Release the lock so the message can be delivered again
    pub async fn abandon(&self) -> Result<(), QueueError> {
        let lock_token = self.begin_settlement("abandon")?;
        let result = execute_with_retry(&self.retry_policy, "abandon", || {
            self.provider.abandon(lock_token)
        })
        .await;
        self.finish_settlement(result)
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter(&self, reason: &str) -> Result<(), QueueError> {
        let lock_token = self.begin_settlement("dead-letter")?;
        let result = execute_with_retry(&self.retry_policy, "dead_letter", || {
            self.provider.dead_letter(lock_token, reason)
        })
        .await;
        self.finish_settlement(result)
    }

    /// Extend the peek lock of an unsettled message
    pub async fn renew_lock(&self) -> Result<(), QueueError> {
        let lock_token = self.require_lock_token("renew the lock of")?;
        if self.is_settled() {
            return Err(QueueError::InvalidOperation {
                message: format!("message with lock {} is already settled", lock_token),
            });
        }
        execute_with_retry(&self.retry_policy, "renew_lock", || {
            self.provider.renew_lock(lock_token)
        })
        .await
    }

    fn require_lock_token(&self, operation: &str) -> Result<&LockToken, QueueError> {
        self.lock_token
            .as_ref()
            .ok_or_else(|| QueueError::InvalidOperation {
                message: format!(
                    "cannot {} a message received in ReceiveAndDelete mode",
                    operation
                ),
            })
    }

    fn begin_settlement(&self, operation: &str) -> Result<&LockToken, QueueError> {
        let lock_token = self.require_lock_token(operation)?;
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::InvalidOperation {
                message: format!("message with lock {} is already settled", lock_token),
            });
        }
        Ok(lock_token)
    }

    // A failed settlement leaves the message unsettled so it can be retried.
    fn finish_settlement(&self, result: Result<(), QueueError>) -> Result<(), QueueError> {
        if result.is_err() {
            self.settled.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl fmt::Debug for MessageActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageActions")
            .field("lock_token", &self.lock_token)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
