//! Receive modes, transport types and the options a transport connector
//! receives when binding a client to a queue.

use crate::auth::TokenProvider;
use crate::connection::ServiceBusConnection;
use crate::message::QueueName;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// When a delivered message is removed from the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Removed as soon as it is delivered; no settlement possible
    ReceiveAndDelete,
    /// Locked on delivery, removed only when completed
    #[default]
    PeekLock,
}

impl fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReceiveAndDelete => write!(f, "ReceiveAndDelete"),
            Self::PeekLock => write!(f, "PeekLock"),
        }
    }
}

/// Wire transport a client uses to reach the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// AMQP over TCP (port 5671)
    Amqp,
    /// AMQP framed in web sockets (port 443)
    AmqpWebSockets,
    /// Service Bus REST API over HTTPS
    Https,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp => write!(f, "Amqp"),
            Self::AmqpWebSockets => write!(f, "AmqpWebSockets"),
            Self::Https => write!(f, "Https"),
        }
    }
}

/// Everything a transport needs to bind a client to one queue
#[derive(Clone)]
pub struct ClientOptions {
    pub connection: ServiceBusConnection,
    pub queue_name: QueueName,
    pub transport: TransportType,
    pub receive_mode: ReceiveMode,
    pub retry_policy: RetryPolicy,
    pub token_provider: Arc<dyn TokenProvider>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("connection", &self.connection)
            .field("queue_name", &self.queue_name)
            .field("transport", &self.transport)
            .field("receive_mode", &self.receive_mode)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
