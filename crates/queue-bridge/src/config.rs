//! Layered settings for building factories and listeners.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. `config/queue-bridge.{yaml,toml,json}` relative to the working directory (optional)
//! 2. An explicit file, passed to [`BridgeSettings::load`] or named by
//!    `QUEUE_BRIDGE_CONFIG` (required when given)
//! 3. Environment variables prefixed `QUEUE_BRIDGE__`, with `__` between
//!    nested keys, e.g. `QUEUE_BRIDGE__RETRY__MAX_RETRIES=3`
//!
//! Every field carries a serde default, so an empty environment yields the
//! built-in defaults. A malformed file or a value of the wrong type is an
//! error.

use crate::client::TransportConnector;
use crate::error::ConfigurationError;
use crate::factory::QueueClientFactory;
use crate::handler::MessageHandlerOptions;
use crate::message::QueueName;
use crate::provider::{ReceiveMode, TransportType};
use crate::retry::{build_retry_policy, RetryPolicy};
use crate::transport::http::HttpTransportConnector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variables read as settings
pub const ENV_PREFIX: &str = "QUEUE_BRIDGE";

/// Environment variable naming an explicit settings file
pub const CONFIG_FILE_ENV: &str = "QUEUE_BRIDGE_CONFIG";

/// Settings file looked up relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/queue-bridge";

const REDACTED: &str = "<redacted>";

/// Top-level settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Service Bus connection string
    pub connection_string: String,

    /// Queue used when a command does not name one
    pub queue_name: Option<String>,

    pub transport: TransportType,

    pub receive_mode: ReceiveMode,

    pub retry: RetrySettings,

    pub listener: ListenerSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            queue_name: None,
            transport: TransportType::Https,
            receive_mode: ReceiveMode::PeekLock,
            retry: RetrySettings::default(),
            listener: ListenerSettings::default(),
        }
    }
}

/// Backoff bounds and retry count, in the units the factory accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub min_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub max_retries: i64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_backoff_secs: 5.0,
            max_backoff_secs: 30.0,
            max_retries: 10,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigurationError> {
        build_retry_policy(self.min_backoff_secs, self.max_backoff_secs, self.max_retries)
    }
}

/// Message pump settings applied when a listener opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub max_concurrent_calls: usize,
    pub auto_complete: bool,
    pub receive_timeout_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: false,
            receive_timeout_secs: 60,
        }
    }
}

impl ListenerSettings {
    /// Handler options with the default tracing diagnostic sink
    pub fn handler_options(&self) -> MessageHandlerOptions {
        MessageHandlerOptions::new()
            .with_max_concurrent_calls(self.max_concurrent_calls)
            .with_auto_complete(self.auto_complete)
            .with_receive_timeout(Duration::from_secs(self.receive_timeout_secs))
    }
}

impl BridgeSettings {
    /// Load settings from the layered sources.
    ///
    /// `explicit` takes precedence over `QUEUE_BRIDGE_CONFIG`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder().add_source(
            config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        );

        let explicit_path = explicit.map(Path::to_path_buf).or_else(|| {
            std::env::var(CONFIG_FILE_ENV)
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
        });
        if let Some(path) = &explicit_path {
            info!(path = %path.display(), "Loading settings from explicit path");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let settings: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        debug!(
            transport = %settings.transport,
            receive_mode = %settings.receive_mode,
            queue_name = ?settings.queue_name,
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Check every value that would otherwise fail later at construction
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection_string".to_string(),
            });
        }

        if let Some(queue_name) = &self.queue_name {
            QueueName::new(queue_name.clone()).map_err(|e| ConfigurationError::Invalid {
                message: format!("queue_name: {}", e),
            })?;
        }

        self.retry.to_policy()?;
        self.listener.handler_options().validate()
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigurationError> {
        self.retry.to_policy()
    }

    pub fn handler_options(&self) -> MessageHandlerOptions {
        self.listener.handler_options()
    }

    /// Queue named on the command line, falling back to the configured one
    pub fn resolve_queue_name<'a>(
        &'a self,
        requested: Option<&'a str>,
    ) -> Result<&'a str, ConfigurationError> {
        requested
            .or(self.queue_name.as_deref())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "queue_name".to_string(),
            })
    }

    /// Factory over the given connector
    pub fn factory(&self, connector: Arc<dyn TransportConnector>) -> QueueClientFactory {
        QueueClientFactory::new(self.connection_string.clone(), self.transport, connector)
    }

    /// Factory over the REST transport
    pub fn http_factory(&self) -> QueueClientFactory {
        self.factory(Arc::new(HttpTransportConnector::new()))
    }

    /// Copy with the shared access key masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.connection_string = redact_connection_string(&self.connection_string);
        copy
    }
}

impl fmt::Debug for BridgeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSettings")
            .field(
                "connection_string",
                &redact_connection_string(&self.connection_string),
            )
            .field("queue_name", &self.queue_name)
            .field("transport", &self.transport)
            .field("receive_mode", &self.receive_mode)
            .field("retry", &self.retry)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Mask the value of every `SharedAccessKey` field
pub fn redact_connection_string(connection_string: &str) -> String {
    match Regex::new(r"(?i)((?:^|;)\s*SharedAccessKey\s*=)[^;]*") {
        Ok(pattern) => pattern
            .replace_all(connection_string, format!("${{1}}{}", REDACTED).as_str())
            .into_owned(),
        Err(_) => REDACTED.to_string(),
    }
}
