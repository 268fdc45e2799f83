//! Connection string parsing.
//!
//! Service Bus connection strings are `key=value` pairs separated by `;`:
//!
//! ```text
//! Endpoint=sb://orders.servicebus.windows.net/;SharedAccessKeyName=RootKey;SharedAccessKey=abc123
//! ```
//!
//! Every required field must appear exactly once. A missing field and a
//! repeated field are both configuration errors; the parser never picks the
//! first of several candidates.

use crate::error::ConfigurationError;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use url::Url;

pub const ENDPOINT: &str = "Endpoint";
pub const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
pub const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
pub const ENTITY_PATH: &str = "EntityPath";

/// Extract the value of a single field from a connection string.
///
/// The field must start at the beginning of the string or directly after a
/// `;`, so `Key` does not match inside `SharedAccessKey`. The value runs up to
/// the next `;`.
///
/// # Errors
///
/// Returns [`ConfigurationError::ConnectionStringKey`] carrying the field
/// name and the number of matches when the field occurs zero or several
/// times.
///
/// # Example
///
/// ```
/// use queue_bridge::connection::extract_field;
///
/// let connection = "Endpoint=sb://x.servicebus.windows.net/;SharedAccessKeyName=RootKey";
/// assert_eq!(extract_field(connection, "SharedAccessKeyName").unwrap(), "RootKey");
/// assert!(extract_field(connection, "SharedAccessKey").is_err());
/// ```
pub fn extract_field(connection_string: &str, field_name: &str) -> Result<String, ConfigurationError> {
    let values = field_matches(connection_string, field_name)?;

    match <[String; 1]>::try_from(values) {
        Ok([value]) => Ok(value),
        Err(values) => Err(ConfigurationError::ConnectionStringKey {
            key: field_name.to_string(),
            matches: values.len(),
        }),
    }
}

fn field_matches(connection_string: &str, field_name: &str) -> Result<Vec<String>, ConfigurationError> {
    let pattern = format!(r"(?:^|;)\s*{}=([^;]*)", regex::escape(field_name));
    let regex = Regex::new(&pattern).map_err(|e| ConfigurationError::Parsing {
        message: format!("invalid pattern for key {}: {}", field_name, e),
    })?;

    Ok(regex
        .captures_iter(connection_string)
        .filter_map(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
        .collect())
}

/// Named fields resolved from a connection string.
///
/// Built once per client-creation call and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    fields: HashMap<String, String>,
}

impl ConnectionDescriptor {
    /// Resolve every required field, failing on the first missing or
    /// ambiguous one.
    pub fn parse(connection_string: &str, required_fields: &[&str]) -> Result<Self, ConfigurationError> {
        let mut fields = HashMap::with_capacity(required_fields.len());
        for field in required_fields {
            let value = extract_field(connection_string, field)?;
            fields.insert((*field).to_string(), value);
        }

        Ok(Self { fields })
    }

    /// Resolve an optional field: absent is fine, repeated is still an error.
    pub fn with_optional(
        mut self,
        connection_string: &str,
        field_name: &str,
    ) -> Result<Self, ConfigurationError> {
        let mut values = field_matches(connection_string, field_name)?;
        match values.len() {
            0 => {}
            1 => {
                let value = values.remove(0);
                self.fields.insert(field_name.to_string(), value);
            }
            matches => {
                return Err(ConfigurationError::ConnectionStringKey {
                    key: field_name.to_string(),
                    matches,
                })
            }
        }

        Ok(self)
    }

    pub fn get(&self, field_name: &str) -> Option<&str> {
        self.fields.get(field_name).map(String::as_str)
    }

    fn require(&self, field_name: &str) -> Result<&str, ConfigurationError> {
        self.get(field_name).ok_or_else(|| ConfigurationError::Missing {
            key: field_name.to_string(),
        })
    }
}

// Values may contain credentials, only the field names are printed.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        f.debug_struct("ConnectionDescriptor")
            .field("fields", &names)
            .finish()
    }
}

/// Typed view over a Service Bus connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceBusConnection {
    endpoint: Url,
    shared_access_key_name: String,
    shared_access_key: String,
    entity_path: Option<String>,
}

impl ServiceBusConnection {
    /// Parse the endpoint and shared access key fields.
    ///
    /// `EntityPath` is optional but may appear at most once.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigurationError> {
        let descriptor = ConnectionDescriptor::parse(
            connection_string,
            &[ENDPOINT, SHARED_ACCESS_KEY_NAME, SHARED_ACCESS_KEY],
        )?
        .with_optional(connection_string, ENTITY_PATH)?;

        let raw_endpoint = descriptor.require(ENDPOINT)?;
        let endpoint = Url::parse(raw_endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("endpoint '{}' is not a valid URL: {}", raw_endpoint, e),
        })?;
        if endpoint.host_str().is_none() {
            return Err(ConfigurationError::Invalid {
                message: format!("endpoint '{}' has no host", raw_endpoint),
            });
        }

        let shared_access_key_name = descriptor.require(SHARED_ACCESS_KEY_NAME)?.to_string();
        let shared_access_key = descriptor.require(SHARED_ACCESS_KEY)?.to_string();
        if shared_access_key_name.is_empty() || shared_access_key.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "shared access key name and key must not be empty".to_string(),
            });
        }

        Ok(Self {
            endpoint,
            shared_access_key_name,
            shared_access_key,
            entity_path: descriptor.get(ENTITY_PATH).map(str::to_string),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fully qualified namespace host, e.g. `orders.servicebus.windows.net`
    pub fn namespace_host(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }

    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

impl fmt::Debug for ServiceBusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusConnection")
            .field("endpoint", &self.endpoint.as_str())
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
