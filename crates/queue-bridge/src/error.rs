//! Error types for queue client, factory and listener operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message lock lost or expired: {lock_token}")]
    MessageLockLost { lock_token: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Server busy: {message}")]
    ServerBusy { message: String },

    #[error("Link to '{entity_path}' is closed: {reason}")]
    LinkClosed { entity_path: String, reason: String },

    #[error("Operation '{operation}' is not supported by the {transport} transport")]
    NotSupported {
        operation: String,
        transport: String,
    },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageLockLost { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ServerBusy { .. } => true,
            Self::LinkClosed { .. } => false,
            Self::NotSupported { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
            Self::Lifecycle(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Check if error concerns a single delivery rather than the link.
    ///
    /// A message that cannot be decoded is skipped; the link stays usable.
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Serialization(_))
    }
}

/// Configuration errors, raised synchronously and never retried
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Could not parse key {key} from service bus connection string. Expected 1 match but got {matches} matches.")]
    ConnectionStringKey { key: String, matches: usize },

    #[error("Invalid retry policy: {message}")]
    InvalidRetryPolicy { message: String },

    #[error("Transport {transport} is not supported: {message}")]
    UnsupportedTransport { transport: String, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Misuse of the listener or client lifecycle
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Listener for '{queue_name}' is already open")]
    AlreadyOpen { queue_name: String },

    #[error("Listener for '{queue_name}' has been closed")]
    Closed { queue_name: String },

    #[error("A message handler is already registered on '{queue_name}'")]
    HandlerAlreadyRegistered { queue_name: String },

    #[error("Client for '{queue_name}' is closed or closing")]
    ClientClosed { queue_name: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
