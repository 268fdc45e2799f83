//! Message types for queue operations including core domain identifiers.

use crate::error::{QueueError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated Service Bus entity name.
///
/// Entity names are 1-260 characters long, may contain ASCII letters, digits,
/// periods, hyphens, underscores and slashes, and must start and end with a
/// letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, periods, hyphens, underscores and slashes allowed"
                    .to_string(),
            });
        }

        let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "must start and end with a letter or digit".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the queue system
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token identifying a peek-locked message.
///
/// The content is transport specific and only meaningful to the provider
/// that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp offset from this one
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a queue
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub label: Option<String>,
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Create new message with body and a fresh message ID
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            body,
            properties: HashMap::new(),
            content_type: None,
            correlation_id: None,
            label: None,
            time_to_live: None,
        }
    }

    /// Create a JSON message from a serializable value
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, QueueError> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(body)).with_content_type("application/json".to_string()))
    }

    /// Override the generated message ID
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Add a custom property
    pub fn with_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: String) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the application-defined label
    pub fn with_label(mut self, label: String) -> Self {
        self.label = Some(label);
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// A message received from a queue with broker metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub label: Option<String>,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub enqueued_at: Option<Timestamp>,
    pub locked_until: Option<Timestamp>,
    /// Present only for messages received in peek-lock mode
    pub lock_token: Option<LockToken>,
}

impl ReceivedMessage {
    /// Body as UTF-8 text
    pub fn body_as_str(&self) -> Result<&str, QueueError> {
        std::str::from_utf8(&self.body).map_err(|e| {
            QueueError::Validation(ValidationError::InvalidFormat {
                field: "body".to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Deserialize the body as JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Convert back to Message (for forwarding/replaying)
    pub fn message(&self) -> Message {
        Message {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            content_type: self.content_type.clone(),
            correlation_id: self.correlation_id.clone(),
            label: self.label.clone(),
            time_to_live: None, // TTL is not preserved in received messages
        }
    }

    /// Check if the peek lock has expired
    pub fn is_lock_expired(&self) -> bool {
        match self.locked_until {
            Some(locked_until) => Timestamp::now() >= locked_until,
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
