//! Queue client factory.
//!
//! The factory holds a connection string, a transport type and a
//! [`TransportConnector`]. Each call parses the connection string, builds the
//! shared access signature credential and the retry policy, validates the
//! queue name and asks the connector for a provider. Nothing touches the
//! network until the returned handle is used.

use crate::auth::SharedAccessSignatureTokenProvider;
use crate::client::{QueueClient, StandardQueueClient, TransportConnector};
use crate::connection::ServiceBusConnection;
use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::provider::{ClientOptions, ReceiveMode, TransportType};
use crate::receiver::MessageReceiver;
use crate::retry::{build_retry_policy, RetryPolicy};
use crate::transport::http::HttpTransportConnector;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;

/// Builds queue clients and receivers for one namespace
#[derive(Clone)]
pub struct QueueClientFactory {
    connection_string: String,
    transport: TransportType,
    connector: Arc<dyn TransportConnector>,
}

impl QueueClientFactory {
    pub fn new(
        connection_string: impl Into<String>,
        transport: TransportType,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            transport,
            connector,
        }
    }

    /// Factory that talks to the namespace over the REST API
    pub fn with_http(connection_string: impl Into<String>) -> Self {
        Self::new(
            connection_string,
            TransportType::Https,
            Arc::new(HttpTransportConnector::new()),
        )
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    /// Client with the default retry policy (5s, 30s, 10 retries)
    pub fn get_queue_client(
        &self,
        queue_name: &str,
        receive_mode: ReceiveMode,
    ) -> Result<Box<dyn QueueClient>, QueueError> {
        self.get_queue_client_with_retry(queue_name, receive_mode, RetryPolicy::default())
    }

    /// Client with a retry policy built from backoff seconds and a retry count
    pub fn get_queue_client_with_backoff(
        &self,
        queue_name: &str,
        receive_mode: ReceiveMode,
        min_backoff_secs: f64,
        max_backoff_secs: f64,
        max_retries: i64,
    ) -> Result<Box<dyn QueueClient>, QueueError> {
        let retry_policy = build_retry_policy(min_backoff_secs, max_backoff_secs, max_retries)?;
        self.get_queue_client_with_retry(queue_name, receive_mode, retry_policy)
    }

    pub fn get_queue_client_with_retry(
        &self,
        queue_name: &str,
        receive_mode: ReceiveMode,
        retry_policy: RetryPolicy,
    ) -> Result<Box<dyn QueueClient>, QueueError> {
        let options = self.client_options(queue_name, receive_mode, retry_policy)?;
        let provider = self.connector.connect(&options)?;

        debug!(
            queue_name = %options.queue_name,
            transport = %options.transport,
            receive_mode = %receive_mode,
            "Queue client created"
        );
        Ok(Box::new(StandardQueueClient::new(
            provider,
            receive_mode,
            retry_policy,
        )))
    }

    /// Pull-style receiver with the default retry policy
    pub fn get_message_receiver(
        &self,
        queue_name: &str,
        receive_mode: ReceiveMode,
    ) -> Result<MessageReceiver, QueueError> {
        let retry_policy = RetryPolicy::default();
        let options = self.client_options(queue_name, receive_mode, retry_policy)?;
        let provider = self.connector.connect(&options)?;

        debug!(
            queue_name = %options.queue_name,
            transport = %options.transport,
            receive_mode = %receive_mode,
            "Message receiver created"
        );
        Ok(MessageReceiver::new(provider, receive_mode, retry_policy))
    }

    fn client_options(
        &self,
        queue_name: &str,
        receive_mode: ReceiveMode,
        retry_policy: RetryPolicy,
    ) -> Result<ClientOptions, QueueError> {
        let connection = ServiceBusConnection::parse(&self.connection_string)?;
        let queue_name = QueueName::new(queue_name.to_string())?;

        if let Some(entity_path) = connection.entity_path() {
            if !entity_path.eq_ignore_ascii_case(queue_name.as_str()) {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "connection string is scoped to '{}' but queue '{}' was requested",
                        entity_path, queue_name
                    ),
                }
                .into());
            }
        }

        if !self.connector.supports(self.transport) {
            return Err(ConfigurationError::UnsupportedTransport {
                transport: self.transport.to_string(),
                message: "the configured connector cannot provide this transport".to_string(),
            }
            .into());
        }

        let token_provider = Arc::new(SharedAccessSignatureTokenProvider::from_connection(
            &connection,
        ));

        Ok(ClientOptions {
            connection,
            queue_name,
            transport: self.transport,
            receive_mode,
            retry_policy,
            token_provider,
        })
    }
}

impl fmt::Debug for QueueClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClientFactory")
            .field("connection_string", &"<redacted>")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
