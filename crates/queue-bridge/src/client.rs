//! Client traits and the standard queue client handle.
//!
//! Two seams separate this crate from the wire:
//!
//! * [`QueueProvider`] performs raw operations against one queue over one
//!   transport.
//! * [`TransportConnector`] turns [`ClientOptions`] into a provider.
//!
//! [`StandardQueueClient`] layers retries, lifecycle tracking and the
//! message pump on top of a provider.

use crate::diagnostics::{DiagnosticSink, DispatchAction, ExceptionReceivedEvent};
use crate::error::{LifecycleError, QueueError};
use crate::handler::{MessageHandler, MessageHandlerOptions};
use crate::message::{LockToken, Message, QueueName, ReceivedMessage};
use crate::provider::{ClientOptions, ReceiveMode, TransportType};
use crate::pump::{MessagePump, PumpHandle};
use crate::retry::{execute_with_retry, RetryPolicy};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Raw queue operations bound to one entity over one transport
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Send a single message
    async fn send(&self, message: &Message) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next message
    async fn receive(
        &self,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Remove a locked message
    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    /// Release the lock on a message so it can be redelivered
    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    /// Move a locked message to the dead-letter sub-queue
    async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), QueueError>;

    /// Extend the lock on a message
    async fn renew_lock(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    /// Release transport resources
    async fn close(&self) -> Result<(), QueueError>;

    /// Namespace endpoint, used in diagnostics
    fn endpoint(&self) -> &str;

    fn entity_path(&self) -> &QueueName;

    fn transport(&self) -> TransportType;
}

/// Creates transport-bound providers for the factory
pub trait TransportConnector: Send + Sync {
    /// Whether this connector can speak the given transport
    fn supports(&self, transport: TransportType) -> bool;

    /// Bind a provider to the queue described by `options`. Must not perform I/O.
    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn QueueProvider>, QueueError>;
}

/// Handle bound to one queue, one receive mode and one retry policy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    fn queue_name(&self) -> &QueueName;

    fn receive_mode(&self) -> ReceiveMode;

    fn retry_policy(&self) -> RetryPolicy;

    /// True once close or abort has started
    fn is_closed_or_closing(&self) -> bool;

    async fn send(&self, message: Message) -> Result<(), QueueError>;

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), QueueError>;

    /// Start the message pump. Returns as soon as the pump is spawned.
    fn register_message_handler(
        &self,
        handler: MessageHandler,
        options: MessageHandlerOptions,
    ) -> Result<(), QueueError>;

    /// Stop the pump, wait for in-flight callbacks and close the link
    async fn close(&self) -> Result<(), QueueError>;

    /// Stop the pump and close the link without waiting
    fn abort(&self);
}

/// State of the link between a client and its queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    Closing,
    Closed,
    Faulted { reason: String },
}

impl LinkStatus {
    pub fn is_closed_or_closing(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Link status shared between a client and its pump
#[derive(Debug)]
pub(crate) struct LinkState {
    status: Mutex<LinkStatus>,
}

impl LinkState {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(LinkStatus::Open),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn status(&self) -> LinkStatus {
        self.lock().clone()
    }

    /// Move an open or faulted link to Closing. False if already closing.
    pub(crate) fn begin_close(&self) -> bool {
        let mut status = self.lock();
        if status.is_closed_or_closing() {
            return false;
        }
        *status = LinkStatus::Closing;
        true
    }

    pub(crate) fn set_closed(&self) {
        *self.lock() = LinkStatus::Closed;
    }

    /// Mark an open link as faulted; closing links keep their status
    pub(crate) fn fault(&self, reason: String) {
        let mut status = self.lock();
        if *status == LinkStatus::Open {
            *status = LinkStatus::Faulted { reason };
        }
    }
}

/// Queue client backed by a [`QueueProvider`]
pub struct StandardQueueClient {
    provider: Arc<dyn QueueProvider>,
    queue_name: QueueName,
    receive_mode: ReceiveMode,
    retry_policy: RetryPolicy,
    link: Arc<LinkState>,
    pump: Mutex<Option<PumpHandle>>,
}

impl StandardQueueClient {
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
            link: Arc::new(LinkState::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn transport(&self) -> TransportType {
        self.provider.transport()
    }

    /// Whether a message pump is registered and still running
    pub fn is_pump_running(&self) -> bool {
        self.lock_pump()
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<PumpHandle>> {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_usable(&self) -> Result<(), QueueError> {
        match self.link.status() {
            LinkStatus::Open => Ok(()),
            LinkStatus::Faulted { reason } => Err(QueueError::LinkClosed {
                entity_path: self.queue_name.to_string(),
                reason,
            }),
            LinkStatus::Closing | LinkStatus::Closed => {
                Err(QueueError::Lifecycle(LifecycleError::ClientClosed {
                    queue_name: self.queue_name.to_string(),
                }))
            }
        }
    }

    fn ensure_peek_lock(&self, operation: &str) -> Result<(), QueueError> {
        if self.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(QueueError::InvalidOperation {
                message: format!(
                    "cannot {} on '{}': client uses ReceiveAndDelete mode",
                    operation, self.queue_name
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for StandardQueueClient {
    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn is_closed_or_closing(&self) -> bool {
        self.link.status().is_closed_or_closing()
    }

    async fn send(&self, message: Message) -> Result<(), QueueError> {
        self.ensure_usable()?;
        execute_with_retry(&self.retry_policy, "send", || self.provider.send(&message)).await?;
        debug!(
            queue_name = %self.queue_name,
            message_id = %message.message_id,
            "Message sent"
        );
        Ok(())
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.ensure_peek_lock("complete")?;
        execute_with_retry(&self.retry_policy, "complete", || {
            self.provider.complete(lock_token)
        })
        .await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.ensure_peek_lock("abandon")?;
        execute_with_retry(&self.retry_policy, "abandon", || {
            self.provider.abandon(lock_token)
        })
        .await
    }

    async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.ensure_peek_lock("dead-letter")?;
        execute_with_retry(&self.retry_policy, "dead_letter", || {
            self.provider.dead_letter(lock_token, reason)
        })
        .await
    }

    fn register_message_handler(
        &self,
        handler: MessageHandler,
        options: MessageHandlerOptions,
    ) -> Result<(), QueueError> {
        options.validate()?;

        // Held across the status check so a concurrent close cannot miss the pump
        let mut pump = self.lock_pump();
        self.ensure_usable()?;
        if pump.is_some() {
            return Err(QueueError::Lifecycle(
                LifecycleError::HandlerAlreadyRegistered {
                    queue_name: self.queue_name.to_string(),
                },
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            QueueError::InvalidOperation {
                message: format!("registering a message handler requires a tokio runtime: {}", e),
            }
        })?;

        info!(
            queue_name = %self.queue_name,
            receive_mode = %self.receive_mode,
            max_concurrent_calls = options.max_concurrent_calls,
            auto_complete = options.auto_complete,
            "Registering message handler"
        );

        let message_pump = MessagePump::new(
            Arc::clone(&self.provider),
            self.receive_mode,
            self.retry_policy,
            handler,
            options,
            Arc::clone(&self.link),
        );
        *pump = Some(message_pump.spawn(&runtime));

        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.link.begin_close() {
            return Err(QueueError::Lifecycle(LifecycleError::ClientClosed {
                queue_name: self.queue_name.to_string(),
            }));
        }

        let pump = self.lock_pump().take();
        let sink = pump.as_ref().map(PumpHandle::diagnostic_sink);
        if let Some(pump) = pump {
            pump.shutdown().await;
        }

        let result = self.provider.close().await;
        self.link.set_closed();
        if let (Err(e), Some(sink)) = (&result, &sink) {
            report_close_error(sink.as_ref(), self.provider.as_ref(), e);
        }

        match &result {
            Ok(()) => info!(queue_name = %self.queue_name, "Queue client closed"),
            Err(e) => warn!(queue_name = %self.queue_name, error = %e, "Queue client closed with error"),
        }
        result
    }

    fn abort(&self) {
        if !self.link.begin_close() {
            return;
        }

        let sink = self.lock_pump().take().map(|pump| {
            let sink = pump.diagnostic_sink();
            pump.abort();
            sink
        });

        let provider = Arc::clone(&self.provider);
        let queue_name = self.queue_name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = provider.close().await {
                        debug!(queue_name = %queue_name, error = %e, "Error closing aborted link");
                        if let Some(sink) = sink {
                            report_close_error(sink.as_ref(), provider.as_ref(), &e);
                        }
                    }
                });
            }
            Err(_) => {
                debug!(queue_name = %queue_name, "No runtime available, link released on drop");
            }
        }

        self.link.set_closed();
        info!(queue_name = %self.queue_name, "Queue client aborted");
    }
}

impl Drop for StandardQueueClient {
    fn drop(&mut self) {
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
        }
    }
}

fn report_close_error(sink: &dyn DiagnosticSink, provider: &dyn QueueProvider, error: &QueueError) {
    let event = ExceptionReceivedEvent::new(
        provider.endpoint(),
        provider.entity_path().as_str(),
        DispatchAction::Close,
        error,
        error.is_transient(),
    );
    sink.exception_received(&event);
}

impl fmt::Debug for StandardQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardQueueClient")
            .field("queue_name", &self.queue_name)
            .field("receive_mode", &self.receive_mode)
            .field("transport", &self.provider.transport())
            .field("retry_policy", &self.retry_policy)
            .field("link", &self.link.status())
            .finish()
    }
}
