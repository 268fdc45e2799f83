//! Shared access signature credentials.
//!
//! A [`SharedAccessSignatureTokenProvider`] is built from the key name and key
//! found in the connection string and signs short-lived tokens for a resource
//! URI (the audience). The token format is
//!
//! ```text
//! SharedAccessSignature sr={audience}&sig={signature}&se={expiry}&skn={key name}
//! ```
//!
//! where `signature` is the base64 HMAC-SHA256 of `"{audience}\n{expiry}"`
//! keyed with the UTF-8 bytes of the shared access key.

use crate::connection::ServiceBusConnection;
use crate::error::QueueError;
use crate::message::Timestamp;
use base64::{engine::general_purpose, Engine as _};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Default validity of minted tokens
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Bearer token for a single audience
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityToken {
    token: String,
    audience: String,
    expires_at: Timestamp,
}

impl SecurityToken {
    /// Header value for `Authorization`
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Expired, or within `margin` of expiring
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        Timestamp::now().add(margin) >= self.expires_at
    }
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityToken")
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Source of authorization tokens for a transport
pub trait TokenProvider: Send + Sync {
    /// Mint a token for `audience` valid for `valid_for`
    fn get_token(&self, audience: &str, valid_for: Duration) -> Result<SecurityToken, QueueError>;
}

/// Token provider signing with a namespace or entity shared access key
#[derive(Clone)]
pub struct SharedAccessSignatureTokenProvider {
    key_name: String,
    key: String,
}

impl SharedAccessSignatureTokenProvider {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    /// Build from the key fields of a parsed connection string
    pub fn from_connection(connection: &ServiceBusConnection) -> Self {
        Self::new(
            connection.shared_access_key_name(),
            connection.shared_access_key(),
        )
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Build the signature string for an explicit expiry (seconds since epoch)
    pub fn create_signature(&self, audience: &str, expiry: i64) -> Result<String, QueueError> {
        let encoded_audience = urlencoding::encode(audience);
        let string_to_sign = format!("{}\n{}", encoded_audience, expiry);

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| {
            QueueError::AuthenticationFailed {
                message: format!("invalid shared access key: {}", e),
            }
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_audience,
            urlencoding::encode(&signature),
            expiry,
            urlencoding::encode(&self.key_name)
        ))
    }
}

impl TokenProvider for SharedAccessSignatureTokenProvider {
    fn get_token(&self, audience: &str, valid_for: Duration) -> Result<SecurityToken, QueueError> {
        let valid_for_secs = i64::try_from(valid_for.as_secs()).unwrap_or(i64::MAX / 2);
        let expiry = Utc::now().timestamp().saturating_add(valid_for_secs);
        let token = self.create_signature(audience, expiry)?;

        let expires_at = Utc
            .timestamp_opt(expiry, 0)
            .single()
            .map(Timestamp::from_datetime)
            .ok_or_else(|| QueueError::AuthenticationFailed {
                message: format!("token expiry {} is out of range", expiry),
            })?;

        Ok(SecurityToken {
            token,
            audience: audience.to_string(),
            expires_at,
        })
    }
}

impl fmt::Debug for SharedAccessSignatureTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAccessSignatureTokenProvider")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
