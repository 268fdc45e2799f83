//! In-memory broker for tests and local development.
//!
//! The broker keeps one FIFO per queue and reproduces the broker behaviour
//! the adapter depends on:
//!
//! - peek-lock delivery with lock tokens, lock expiry and lock renewal
//! - receive-and-delete delivery
//! - delivery counting, with dead-lettering once `max_delivery_count` is reached
//! - message time-to-live
//! - long-polling receives that wake up as soon as a message is sent
//!
//! Receive and close failures can be injected per queue to exercise retry
//! and fault handling.

use crate::client::{QueueProvider, TransportConnector};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{LockToken, Message, MessageId, QueueName, ReceivedMessage, Timestamp};
use crate::provider::{ClientOptions, ReceiveMode, TransportType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Property set on dead-lettered messages
pub const DEAD_LETTER_REASON_PROPERTY: &str = "DeadLetterReason";

/// Reason recorded when a message exceeds its delivery budget
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

const PROVIDER_NAME: &str = "InMemory";

/// Behaviour of an [`InMemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryConfig {
    /// How long a peek-lock delivery stays locked
    pub lock_duration: Duration,
    /// Deliveries after which an abandoned or expired message is dead-lettered
    pub max_delivery_count: u32,
    /// Active messages a queue may hold before sends are rejected
    pub max_queue_size: usize,
    /// Create queues on first use instead of failing with QueueNotFound
    pub auto_create_queues: bool,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            max_queue_size: 10_000,
            auto_create_queues: true,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    properties: HashMap<String, String>,
    content_type: Option<String>,
    correlation_id: Option<String>,
    label: Option<String>,
    sequence_number: i64,
    delivery_count: u32,
    enqueued_at: Timestamp,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn to_received(&self, lock: Option<(LockToken, Timestamp)>) -> ReceivedMessage {
        let (lock_token, locked_until) = match lock {
            Some((token, until)) => (Some(token), Some(until)),
            None => (None, None),
        };

        ReceivedMessage {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            content_type: self.content_type.clone(),
            correlation_id: self.correlation_id.clone(),
            label: self.label.clone(),
            sequence_number: self.sequence_number,
            delivery_count: self.delivery_count,
            enqueued_at: Some(self.enqueued_at),
            locked_until,
            lock_token,
        }
    }
}

#[derive(Debug)]
struct LockedMessage {
    message: StoredMessage,
    lock_expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueStore {
    active: VecDeque<StoredMessage>,
    locked: HashMap<String, LockedMessage>,
    dead_letter: Vec<StoredMessage>,
    next_sequence_number: i64,
    receive_faults: VecDeque<QueueError>,
    close_faults: VecDeque<QueueError>,
}

impl QueueStore {
    /// Put a message back in sequence order
    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .active
            .iter()
            .position(|queued| queued.sequence_number > message.sequence_number)
            .unwrap_or(self.active.len());
        self.active.insert(position, message);
    }

    fn move_to_dead_letter(&mut self, mut message: StoredMessage, reason: &str) {
        message
            .properties
            .insert(DEAD_LETTER_REASON_PROPERTY.to_string(), reason.to_string());
        debug!(
            message_id = %message.message_id,
            reason = reason,
            "Message moved to dead-letter queue"
        );
        self.dead_letter.push(message);
    }

    /// Return a released message to the queue, or dead-letter it when its
    /// delivery budget is spent
    fn release(&mut self, message: StoredMessage, max_delivery_count: u32) {
        if message.delivery_count >= max_delivery_count {
            self.move_to_dead_letter(message, MAX_DELIVERY_COUNT_EXCEEDED);
        } else {
            self.requeue(message);
        }
    }

    fn release_expired_locks(&mut self, now: Instant, max_delivery_count: u32) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, locked)| now >= locked.lock_expires_at)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                debug!(message_id = %locked.message.message_id, "Message lock expired");
                self.release(locked.message, max_delivery_count);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let before = self.active.len();
        self.active.retain(|message| !message.is_expired(now));
        let purged = before - self.active.len();
        if purged > 0 {
            debug!(purged = purged, "Expired messages removed");
        }
    }

    fn next_lock_expiry(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.lock_expires_at).min()
    }

    fn take_next(
        &mut self,
        mode: ReceiveMode,
        lock_duration: Duration,
        now: Instant,
    ) -> Option<ReceivedMessage> {
        let mut message = self.active.pop_front()?;
        message.delivery_count = message.delivery_count.saturating_add(1);

        match mode {
            ReceiveMode::ReceiveAndDelete => Some(message.to_received(None)),
            ReceiveMode::PeekLock => {
                let token = LockToken::new(uuid::Uuid::new_v4().to_string());
                let locked_until = lock_deadline(lock_duration);
                let received = message.to_received(Some((token.clone(), locked_until)));
                self.locked.insert(
                    token.as_str().to_string(),
                    LockedMessage {
                        message,
                        lock_expires_at: now + lock_duration,
                    },
                );
                Some(received)
            }
        }
    }

    /// Remove a live lock. Expired locks have already been released.
    fn take_lock(&mut self, lock_token: &LockToken) -> Result<LockedMessage, QueueError> {
        self.locked
            .remove(lock_token.as_str())
            .ok_or_else(|| QueueError::MessageLockLost {
                lock_token: lock_token.to_string(),
            })
    }
}

fn lock_deadline(lock_duration: Duration) -> Timestamp {
    let chrono_duration =
        chrono::Duration::from_std(lock_duration).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Timestamp::now().add(chrono_duration)
}

#[derive(Debug, Default)]
struct QueueState {
    store: Mutex<QueueStore>,
    arrivals: Notify,
}

impl QueueState {
    fn lock(&self) -> MutexGuard<'_, QueueStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct BrokerInner {
    config: InMemoryConfig,
    queues: RwLock<HashMap<QueueName, Arc<QueueState>>>,
}

/// Shared in-memory broker. Cloning yields another handle to the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.inner.config
    }

    /// Create a queue. Creating an existing queue is a no-op.
    pub fn create_queue(&self, queue_name: &QueueName) {
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queues.entry(queue_name.clone()).or_insert_with(|| {
            info!(queue_name = %queue_name, "In-memory queue created");
            Arc::new(QueueState::default())
        });
    }

    /// Delete a queue and everything in it
    pub fn delete_queue(&self, queue_name: &QueueName) -> bool {
        self.inner
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(queue_name)
            .is_some()
    }

    pub fn queue_exists(&self, queue_name: &QueueName) -> bool {
        self.inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(queue_name)
    }

    fn queue(&self, queue_name: &QueueName) -> Result<Arc<QueueState>, QueueError> {
        let existing = self
            .inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(queue_name)
            .cloned();

        match existing {
            Some(state) => Ok(state),
            None if self.inner.config.auto_create_queues => {
                self.create_queue(queue_name);
                self.queue(queue_name)
            }
            None => Err(QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            }),
        }
    }

    pub fn send(&self, queue_name: &QueueName, message: &Message) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        {
            let mut store = state.lock();
            if store.active.len() >= self.inner.config.max_queue_size {
                return Err(QueueError::ProviderError {
                    provider: PROVIDER_NAME.to_string(),
                    code: "QuotaExceeded".to_string(),
                    message: format!(
                        "queue '{}' holds {} messages",
                        queue_name, self.inner.config.max_queue_size
                    ),
                });
            }

            store.next_sequence_number += 1;
            let stored = StoredMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                content_type: message.content_type.clone(),
                correlation_id: message.correlation_id.clone(),
                label: message.label.clone(),
                sequence_number: store.next_sequence_number,
                delivery_count: 0,
                enqueued_at: Timestamp::now(),
                expires_at: message
                    .time_to_live
                    .and_then(|ttl| ttl.to_std().ok())
                    .and_then(|ttl| Instant::now().checked_add(ttl)),
            };
            store.active.push_back(stored);
        }
        state.arrivals.notify_waiters();

        debug!(queue_name = %queue_name, message_id = %message.message_id, "Message enqueued");
        Ok(())
    }

    /// Wait up to `timeout` for a message
    pub async fn receive(
        &self,
        queue_name: &QueueName,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            QueueError::from(ConfigurationError::Invalid {
                message: format!("receive timeout {:?} is out of range", timeout),
            })
        })?;

        loop {
            let state = self.queue(queue_name)?;
            let arrival = state.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let wake_at = {
                let mut store = state.lock();
                if let Some(fault) = store.receive_faults.pop_front() {
                    return Err(fault);
                }

                let now = Instant::now();
                store.release_expired_locks(now, self.inner.config.max_delivery_count);
                store.purge_expired(now);
                if let Some(message) = store.take_next(mode, self.inner.config.lock_duration, now)
                {
                    return Ok(Some(message));
                }

                match store.next_lock_expiry() {
                    Some(expiry) => expiry.min(deadline),
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub fn complete(&self, queue_name: &QueueName, lock_token: &LockToken) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        let mut store = state.lock();
        store.release_expired_locks(Instant::now(), self.inner.config.max_delivery_count);
        let locked = store.take_lock(lock_token)?;
        debug!(queue_name = %queue_name, message_id = %locked.message.message_id, "Message completed");
        Ok(())
    }

    pub fn abandon(&self, queue_name: &QueueName, lock_token: &LockToken) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        {
            let mut store = state.lock();
            store.release_expired_locks(Instant::now(), self.inner.config.max_delivery_count);
            let locked = store.take_lock(lock_token)?;
            debug!(queue_name = %queue_name, message_id = %locked.message.message_id, "Message abandoned");
            store.release(locked.message, self.inner.config.max_delivery_count);
        }
        state.arrivals.notify_waiters();
        Ok(())
    }

    pub fn dead_letter(
        &self,
        queue_name: &QueueName,
        lock_token: &LockToken,
        reason: &str,
    ) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        let mut store = state.lock();
        store.release_expired_locks(Instant::now(), self.inner.config.max_delivery_count);
        let locked = store.take_lock(lock_token)?;
        store.move_to_dead_letter(locked.message, reason);
        Ok(())
    }

    pub fn renew_lock(&self, queue_name: &QueueName, lock_token: &LockToken) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        let mut store = state.lock();
        let now = Instant::now();
        store.release_expired_locks(now, self.inner.config.max_delivery_count);
        let lock_duration = self.inner.config.lock_duration;
        match store.locked.get_mut(lock_token.as_str()) {
            Some(locked) => {
                locked.lock_expires_at = now + lock_duration;
                Ok(())
            }
            None => Err(QueueError::MessageLockLost {
                lock_token: lock_token.to_string(),
            }),
        }
    }

    /// Make the next receive on `queue_name` fail with `error`.
    /// Several injected errors are returned in order.
    pub fn inject_receive_error(&self, queue_name: &QueueName, error: QueueError) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        state.lock().receive_faults.push_back(error);
        state.arrivals.notify_waiters();
        Ok(())
    }

    /// Make the next provider close on `queue_name` fail with `error`.
    /// The provider is closed regardless.
    pub fn inject_close_error(&self, queue_name: &QueueName, error: QueueError) -> Result<(), QueueError> {
        let state = self.queue(queue_name)?;
        state.lock().close_faults.push_back(error);
        Ok(())
    }

    /// Messages waiting for delivery
    pub fn active_message_count(&self, queue_name: &QueueName) -> usize {
        self.with_store(queue_name, |store| store.active.len())
    }

    /// Messages currently held under a peek lock
    pub fn locked_message_count(&self, queue_name: &QueueName) -> usize {
        self.with_store(queue_name, |store| store.locked.len())
    }

    /// Snapshot of the dead-letter sub-queue
    pub fn dead_letter_messages(&self, queue_name: &QueueName) -> Vec<ReceivedMessage> {
        self.with_store(queue_name, |store| {
            store
                .dead_letter
                .iter()
                .map(|message| message.to_received(None))
                .collect()
        })
    }

    fn with_store<T: Default>(&self, queue_name: &QueueName, read: impl FnOnce(&QueueStore) -> T) -> T {
        let state = self
            .inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(queue_name)
            .cloned();

        match state {
            Some(state) => read(&state.lock()),
            None => T::default(),
        }
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue_count = self
            .inner
            .queues
            .read()
            .map(|queues| queues.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryBroker")
            .field("config", &self.inner.config)
            .field("queues", &queue_count)
            .finish()
    }
}

impl TransportConnector for InMemoryBroker {
    fn supports(&self, _transport: TransportType) -> bool {
        true
    }

    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn QueueProvider>, QueueError> {
        Ok(Arc::new(InMemoryQueueProvider {
            broker: self.clone(),
            queue_name: options.queue_name.clone(),
            endpoint: options.connection.endpoint().to_string(),
            transport: options.transport,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Provider bound to one queue of an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryQueueProvider {
    broker: InMemoryBroker,
    queue_name: QueueName,
    endpoint: String,
    transport: TransportType,
    closed: AtomicBool,
}

impl InMemoryQueueProvider {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                entity_path: self.queue_name.to_string(),
                reason: "link closed by client".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueProvider for InMemoryQueueProvider {
    async fn send(&self, message: &Message) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.send(&self.queue_name, message)
    }

    async fn receive(
        &self,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        self.ensure_open()?;
        self.broker.receive(&self.queue_name, mode, timeout).await
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.complete(&self.queue_name, lock_token)
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.abandon(&self.queue_name, lock_token)
    }

    async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.dead_letter(&self.queue_name, lock_token, reason)
    }

    async fn renew_lock(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.renew_lock(&self.queue_name, lock_token)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        let fault = match self.broker.queue(&self.queue_name) {
            Ok(state) => {
                let fault = state.lock().close_faults.pop_front();
                fault
            }
            Err(_) => None,
        };
        match fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn entity_path(&self) -> &QueueName {
        &self.queue_name
    }

    fn transport(&self) -> TransportType {
        self.transport
    }
}
