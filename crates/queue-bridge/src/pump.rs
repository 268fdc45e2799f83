//! Message pump: the background receive loop behind a registered handler.
//!
//! The pump acquires a concurrency permit, receives one message and hands it
//! to a dispatch task in a [`JoinSet`]. The permit is held until the callback
//! and any automatic settlement have finished, so `max_concurrent_calls = 1`
//! gives strictly sequential delivery.
//!
//! Transient receive failures are retried with the client's retry policy. A
//! message that cannot be decoded is reported and skipped. Anything else
//! faults the link and stops the pump.

use crate::client::{LinkState, QueueProvider};
use crate::diagnostics::{DiagnosticSink, DispatchAction, ExceptionReceivedEvent};
use crate::error::QueueError;
use crate::handler::{MessageActions, MessageHandler, MessageHandlerOptions};
use crate::message::ReceivedMessage;
use crate::provider::ReceiveMode;
use crate::retry::{RetryPolicy, RetryState};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle to a running pump task
pub(crate) struct PumpHandle {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
    sink: Arc<dyn DiagnosticSink>,
}

impl PumpHandle {
    /// Sink registered with the handler, kept for errors raised while closing
    pub(crate) fn diagnostic_sink(&self) -> Arc<dyn DiagnosticSink> {
        Arc::clone(&self.sink)
    }

    /// Stop receiving and wait for in-flight callbacks to finish
    pub(crate) async fn shutdown(self) {
        self.cancellation.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "Message pump panicked");
            }
        }
    }

    /// Stop receiving and drop in-flight callbacks
    pub(crate) fn abort(self) {
        self.cancellation.cancel();
        self.task.abort();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl fmt::Debug for PumpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpHandle")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Everything a dispatch task needs, shared across tasks
struct Dispatcher {
    provider: Arc<dyn QueueProvider>,
    receive_mode: ReceiveMode,
    retry_policy: RetryPolicy,
    handler: MessageHandler,
    auto_complete: bool,
    sink: Arc<dyn DiagnosticSink>,
    cancellation: CancellationToken,
}

impl Dispatcher {
    fn report(&self, action: DispatchAction, error: impl fmt::Display, is_transient: bool) {
        let event = ExceptionReceivedEvent::new(
            self.provider.endpoint(),
            self.provider.entity_path().as_str(),
            action,
            error,
            is_transient,
        );
        self.sink.exception_received(&event);
    }

    fn report_queue_error(&self, action: DispatchAction, error: &QueueError) {
        self.report(action, error, error.is_transient());
    }

    async fn dispatch(&self, message: ReceivedMessage) {
        let message_id = message.message_id.clone();
        let actions = MessageActions::new(
            Arc::clone(&self.provider),
            self.retry_policy,
            message.lock_token.clone(),
        );
        let settle_automatically = self.auto_complete && self.receive_mode == ReceiveMode::PeekLock;

        let callback = (self.handler)(message, actions.clone(), self.cancellation.child_token());

        // Run the callback in its own task so a panic is contained. The set is
        // dropped with this task, which aborts the callback on pump abort.
        let mut callback_task = JoinSet::new();
        callback_task.spawn(callback);
        let outcome = match callback_task.join_next().await {
            Some(Ok(result)) => result.map_err(|e| e.to_string()),
            Some(Err(join_error)) if join_error.is_panic() => {
                Err("message handler panicked".to_string())
            }
            Some(Err(join_error)) => Err(join_error.to_string()),
            None => Err("message handler task missing".to_string()),
        };

        match outcome {
            Ok(()) => {
                debug!(message_id = %message_id, "Message handler succeeded");
                if settle_automatically && !actions.is_settled() {
                    if let Err(e) = actions.complete().await {
                        self.report_queue_error(DispatchAction::Complete, &e);
                    }
                }
            }
            Err(handler_error) => {
                self.report(DispatchAction::UserCallback, &handler_error, false);
                if settle_automatically && !actions.is_settled() {
                    if let Err(e) = actions.abandon().await {
                        self.report_queue_error(DispatchAction::Abandon, &e);
                    }
                }
            }
        }
    }
}

/// Receive loop configured from one handler registration
pub(crate) struct MessagePump {
    dispatcher: Arc<Dispatcher>,
    max_concurrent_calls: usize,
    receive_timeout: Duration,
    link: Arc<LinkState>,
}

impl MessagePump {
    pub(crate) fn new(
        provider: Arc<dyn QueueProvider>,
        receive_mode: ReceiveMode,
        retry_policy: RetryPolicy,
        handler: MessageHandler,
        options: MessageHandlerOptions,
        link: Arc<LinkState>,
    ) -> Self {
        let dispatcher = Dispatcher {
            provider,
            receive_mode,
            retry_policy,
            handler,
            auto_complete: options.auto_complete,
            sink: options.diagnostic_sink,
            cancellation: CancellationToken::new(),
        };

        Self {
            dispatcher: Arc::new(dispatcher),
            max_concurrent_calls: options.max_concurrent_calls,
            receive_timeout: options.receive_timeout,
            link,
        }
    }

    pub(crate) fn spawn(self, runtime: &tokio::runtime::Handle) -> PumpHandle {
        let cancellation = self.dispatcher.cancellation.clone();
        let sink = Arc::clone(&self.dispatcher.sink);
        let dispatcher = Arc::clone(&self.dispatcher);
        let link = Arc::clone(&self.link);

        // The loop runs in a nested set so aborting the outer task aborts it too.
        let task = runtime.spawn(async move {
            let mut pump = JoinSet::new();
            pump.spawn(self.run());
            if let Some(Err(e)) = pump.join_next().await {
                if e.is_panic() {
                    let reason = format!("message pump panicked: {}", e);
                    error!(reason = %reason, "Link faulted, stopping message pump");
                    dispatcher.report(DispatchAction::Receive, &reason, false);
                    link.fault(reason);
                }
            }
        });
        PumpHandle {
            cancellation,
            task,
            sink,
        }
    }

    async fn run(self) {
        let dispatcher = &self.dispatcher;
        let cancellation = dispatcher.cancellation.clone();
        let entity_path = dispatcher.provider.entity_path().clone();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_calls));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut retry_state = RetryState::new();

        info!(
            entity_path = %entity_path,
            max_concurrent_calls = self.max_concurrent_calls,
            "Message pump started"
        );

        loop {
            while let Some(result) = in_flight.try_join_next() {
                observe_dispatch(result);
            }

            let permit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                received = dispatcher.provider.receive(dispatcher.receive_mode, self.receive_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    retry_state.reset();
                    debug!(
                        entity_path = %entity_path,
                        message_id = %message.message_id,
                        delivery_count = message.delivery_count,
                        "Dispatching message"
                    );
                    let dispatcher = Arc::clone(dispatcher);
                    in_flight.spawn(async move {
                        dispatcher.dispatch(message).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    retry_state.reset();
                }
                Err(e) if e.is_delivery_error() => {
                    // The link answered; only this delivery was unreadable.
                    retry_state.reset();
                    dispatcher.report(DispatchAction::Receive, &e, false);
                    warn!(entity_path = %entity_path, error = %e, "Skipping undecodable message");
                }
                Err(e) => {
                    let is_transient = e.is_transient();
                    dispatcher.report(DispatchAction::Receive, &e, is_transient);

                    if is_transient && retry_state.can_retry(&dispatcher.retry_policy) {
                        let delay = retry_state.get_delay(&dispatcher.retry_policy);
                        retry_state.next_attempt();
                        debug!(
                            entity_path = %entity_path,
                            attempt = retry_state.attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying receive"
                        );
                        drop(permit);
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        let reason = if is_transient {
                            format!(
                                "receive retries exhausted after {} attempts: {}",
                                retry_state.attempt.saturating_add(1),
                                e
                            )
                        } else {
                            e.to_string()
                        };
                        warn!(entity_path = %entity_path, reason = %reason, "Link faulted, stopping message pump");
                        self.link.fault(reason);
                        break;
                    }
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            observe_dispatch(result);
        }

        info!(entity_path = %entity_path, "Message pump stopped");
    }
}

fn observe_dispatch(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}
