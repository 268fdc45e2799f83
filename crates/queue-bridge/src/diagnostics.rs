//! Diagnostic sink for errors raised inside the dispatch pump.
//!
//! Pump errors never reach the user callback. They are turned into an
//! [`ExceptionReceivedEvent`] and handed to the [`DiagnosticSink`] configured
//! on the listener. The default sink writes a structured `tracing` event.

use crate::message::Timestamp;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, warn};

/// The pump operation that was running when an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DispatchAction {
    Receive,
    Complete,
    Abandon,
    UserCallback,
    Close,
}

impl fmt::Display for DispatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Receive => "Receive",
            Self::Complete => "Complete",
            Self::Abandon => "Abandon",
            Self::UserCallback => "UserCallback",
            Self::Close => "Close",
        };
        write!(f, "{}", name)
    }
}

/// Structured record of one dispatch error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionReceivedEvent {
    pub timestamp: Timestamp,
    pub endpoint: String,
    pub entity_path: String,
    pub action: DispatchAction,
    pub error: String,
    pub is_transient: bool,
}

impl ExceptionReceivedEvent {
    pub fn new(
        endpoint: impl Into<String>,
        entity_path: impl Into<String>,
        action: DispatchAction,
        error: impl fmt::Display,
        is_transient: bool,
    ) -> Self {
        Self {
            timestamp: Timestamp::now(),
            endpoint: endpoint.into(),
            entity_path: entity_path.into(),
            action,
            error: error.to_string(),
            is_transient,
        }
    }
}

/// Receiver of dispatch errors
pub trait DiagnosticSink: Send + Sync {
    fn exception_received(&self, event: &ExceptionReceivedEvent);
}

/// Emits each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn exception_received(&self, event: &ExceptionReceivedEvent) {
        if event.is_transient {
            warn!(
                endpoint = %event.endpoint,
                entity_path = %event.entity_path,
                action = %event.action,
                timestamp = %event.timestamp,
                error = %event.error,
                "Message handler encountered a transient exception"
            );
        } else {
            error!(
                endpoint = %event.endpoint,
                entity_path = %event.entity_path,
                action = %event.action,
                timestamp = %event.timestamp,
                error = %event.error,
                "Message handler encountered an exception"
            );
        }
    }
}

/// Keeps every event in memory; useful for tests and health probes
#[derive(Debug, Default)]
pub struct MemoryDiagnosticSink {
    events: Mutex<Vec<ExceptionReceivedEvent>>,
}

impl MemoryDiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<ExceptionReceivedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Recorded events for one action
    pub fn events_for(&self, action: DispatchAction) -> Vec<ExceptionReceivedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.action == action)
            .collect()
    }
}

impl DiagnosticSink for MemoryDiagnosticSink {
    fn exception_received(&self, event: &ExceptionReceivedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
#[path = "diagnostics_tests.rs"]
mod tests;
