//! # Queue Bridge
//!
//! Service Bus queue client factory and listener lifecycle adapter.
//!
//! This library provides:
//! - Connection string parsing and shared access signature credentials
//! - A factory producing queue client handles and pull-style receivers
//! - Retry policies with exponential backoff
//! - A bounded-concurrency message pump behind each client handle
//! - An open/close/abort listener for hosting a handler in a service
//! - An in-memory broker and a REST transport
//!
//! ## Module Organization
//!
//! - [`connection`] - Connection string parsing
//! - [`auth`] - Shared access signature tokens
//! - [`retry`] - Retry policy and retry execution
//! - [`factory`] - Queue client factory
//! - [`client`] - Provider and client traits, the standard client handle
//! - [`handler`] - Message handler callbacks, options and settlement actions
//! - [`receiver`] - Pull-style message receiver
//! - [`listener`] - Listener lifecycle adapter
//! - [`diagnostics`] - Dispatch error reporting
//! - [`transport`] - In-memory and REST transports
//! - [`config`] - Layered settings
//!
//! ## Example
//!
//! ```no_run
//! use queue_bridge::{
//!     message_handler, CommunicationListener, MessageHandlerOptions, QueueClientFactory,
//!     QueueListener, ReceiveMode,
//! };
//!
//! # async fn run() -> Result<(), queue_bridge::QueueError> {
//! let factory = QueueClientFactory::with_http(
//!     "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=Root;SharedAccessKey=abc",
//! );
//! let client = factory.get_queue_client("orders", ReceiveMode::PeekLock)?;
//! let handler = message_handler(|message, actions, _cancel| async move {
//!     println!("{}", message.body_as_str()?);
//!     actions.complete().await?;
//!     Ok(())
//! });
//!
//! let listener = QueueListener::new(client, handler, MessageHandlerOptions::default());
//! listener.open().await?;
//! listener.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod handler;
pub mod listener;
pub mod message;
pub mod provider;
mod pump;
pub mod receiver;
pub mod retry;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use auth::{SecurityToken, SharedAccessSignatureTokenProvider, TokenProvider};
pub use client::{LinkStatus, QueueClient, QueueProvider, StandardQueueClient, TransportConnector};
pub use config::BridgeSettings;
pub use connection::{extract_field, ConnectionDescriptor, ServiceBusConnection};
pub use diagnostics::{
    DiagnosticSink, DispatchAction, ExceptionReceivedEvent, MemoryDiagnosticSink,
    TracingDiagnosticSink,
};
pub use error::{ConfigurationError, LifecycleError, QueueError, ValidationError};
pub use factory::QueueClientFactory;
pub use handler::{
    message_handler, HandlerError, MessageActions, MessageHandler, MessageHandlerOptions,
};
pub use listener::{CommunicationListener, ListenerState, QueueListener};
pub use message::{LockToken, Message, MessageId, QueueName, ReceivedMessage, Timestamp};
pub use provider::{ClientOptions, ReceiveMode, TransportType};
pub use receiver::MessageReceiver;
pub use retry::{build_retry_policy, RetryPolicy};
pub use transport::{HttpTransportConnector, InMemoryBroker, InMemoryConfig};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
