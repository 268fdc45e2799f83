//! Service Bus REST transport.
//!
//! Talks to the namespace over HTTPS and authorizes every request with a
//! shared access signature token.
//!
//! | Operation | Request | Success |
//! |-----------|---------|---------|
//! | send | `POST {queue}/messages` | 201 |
//! | peek-lock receive | `POST {queue}/messages/head?timeout=N` | 201, 204 when empty |
//! | receive-and-delete | `DELETE {queue}/messages/head?timeout=N` | 200, 204 when empty |
//! | complete | `DELETE {queue}/messages/{id}/{lock}` | 200 |
//! | abandon | `PUT {queue}/messages/{id}/{lock}` | 200 |
//! | renew lock | `POST {queue}/messages/{id}/{lock}` | 200 |
//!
//! Message metadata travels in the `BrokerProperties` JSON header. Custom
//! properties are sent as headers with JSON string values; standard HTTP and
//! `x-ms-` headers are never read back as properties.
//!
//! Dead-lettering has no REST operation and fails with
//! [`QueueError::NotSupported`].

use crate::auth::{SecurityToken, TokenProvider, DEFAULT_TOKEN_TTL};
use crate::client::{QueueProvider, TransportConnector};
use crate::error::{ConfigurationError, QueueError, ValidationError};
use crate::message::{LockToken, Message, MessageId, QueueName, ReceivedMessage, Timestamp};
use crate::provider::{ClientOptions, ReceiveMode, TransportType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

const PROVIDER_NAME: &str = "ServiceBusHttp";

/// Header carrying message metadata
pub const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Extra time a receive request may take beyond its server-side timeout
const RECEIVE_REQUEST_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Message metadata exchanged in the `BrokerProperties` header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<u32>,
    /// RFC 2822 date, e.g. `Wed, 05 Dec 2012 19:31:55 GMT`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_time_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until_utc: Option<String>,
}

impl BrokerProperties {
    fn for_message(message: &Message) -> Self {
        Self {
            message_id: Some(message.message_id.to_string()),
            correlation_id: message.correlation_id.clone(),
            label: message.label.clone(),
            time_to_live: message
                .time_to_live
                .and_then(|ttl| ttl.to_std().ok())
                .map(|ttl| ttl.as_secs_f64()),
            ..Self::default()
        }
    }
}

fn parse_broker_date(value: Option<&str>) -> Option<Timestamp> {
    let value = value?;
    match DateTime::parse_from_rfc2822(value) {
        Ok(date) => Some(Timestamp::from_datetime(date.with_timezone(&Utc))),
        Err(e) => {
            debug!(value = value, error = %e, "Ignoring unparseable broker date");
            None
        }
    }
}

/// Convert a namespace endpoint into the HTTPS base URL of the REST API.
///
/// `sb://` endpoints are rewritten to `https://`; `http://` and `https://`
/// endpoints are used as given.
pub fn rest_base_url(endpoint: &Url) -> Result<Url, ConfigurationError> {
    match endpoint.scheme() {
        "http" | "https" => Ok(endpoint.clone()),
        "sb" => {
            let host = endpoint.host_str().ok_or_else(|| ConfigurationError::Invalid {
                message: format!("endpoint '{}' has no host", endpoint),
            })?;
            let rebuilt = match endpoint.port() {
                Some(port) => format!("https://{}:{}{}", host, port, endpoint.path()),
                None => format!("https://{}{}", host, endpoint.path()),
            };
            Url::parse(&rebuilt).map_err(|e| ConfigurationError::Invalid {
                message: format!("cannot derive REST endpoint from '{}': {}", endpoint, e),
            })
        }
        other => Err(ConfigurationError::Invalid {
            message: format!("unsupported endpoint scheme '{}'", other),
        }),
    }
}

/// Connector for the Service Bus REST API
#[derive(Debug, Clone)]
pub struct HttpTransportConnector {
    http_client: reqwest::Client,
}

impl Default for HttpTransportConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransportConnector {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots, timeouts)
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

impl TransportConnector for HttpTransportConnector {
    fn supports(&self, transport: TransportType) -> bool {
        transport == TransportType::Https
    }

    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn QueueProvider>, QueueError> {
        if !self.supports(options.transport) {
            return Err(ConfigurationError::UnsupportedTransport {
                transport: options.transport.to_string(),
                message: "the REST connector only speaks Https".to_string(),
            }
            .into());
        }

        let base_url = rest_base_url(options.connection.endpoint())?;
        let queue_url = format!(
            "{}/{}",
            base_url.as_str().trim_end_matches('/'),
            options.queue_name
        );

        Ok(Arc::new(ServiceBusHttpProvider {
            http_client: self.http_client.clone(),
            endpoint: options.connection.endpoint().to_string(),
            queue_name: options.queue_name.clone(),
            queue_url,
            token_provider: Arc::clone(&options.token_provider),
            cached_token: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

/// What a request was for, used when mapping failures
#[derive(Debug, Clone, Copy)]
enum RequestKind<'a> {
    Send,
    Receive,
    Settle(&'a LockToken),
}

/// Provider bound to one queue over the REST API
pub struct ServiceBusHttpProvider {
    http_client: reqwest::Client,
    endpoint: String,
    queue_name: QueueName,
    queue_url: String,
    token_provider: Arc<dyn TokenProvider>,
    cached_token: Mutex<Option<SecurityToken>>,
    closed: AtomicBool,
}

impl ServiceBusHttpProvider {
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                entity_path: self.queue_name.to_string(),
                reason: "link closed by client".to_string(),
            });
        }
        Ok(())
    }

    fn authorization(&self) -> Result<HeaderValue, QueueError> {
        let mut cached = self
            .cached_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let token = match cached.as_ref() {
            Some(token) if !token.expires_within(TOKEN_REFRESH_MARGIN) => token.clone(),
            _ => {
                let token = self
                    .token_provider
                    .get_token(&self.queue_url, DEFAULT_TOKEN_TTL)?;
                debug!(audience = %token.audience(), expires_at = %token.expires_at(), "Minted access token");
                *cached = Some(token.clone());
                token
            }
        };

        HeaderValue::from_str(token.as_str()).map_err(|e| QueueError::AuthenticationFailed {
            message: format!("token is not a valid header value: {}", e),
        })
    }

    fn settlement_url(&self, lock_token: &LockToken) -> Result<String, QueueError> {
        let (message_id, lock) =
            lock_token
                .as_str()
                .rsplit_once('/')
                .ok_or_else(|| QueueError::InvalidOperation {
                    message: format!("lock token '{}' was not issued by this transport", lock_token),
                })?;

        Ok(format!(
            "{}/messages/{}/{}",
            self.queue_url,
            urlencoding::encode(message_id),
            urlencoding::encode(lock)
        ))
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<bytes::Bytes>,
        timeout: Duration,
        kind: RequestKind<'_>,
    ) -> Result<reqwest::Response, QueueError> {
        self.ensure_open()?;

        let mut request = self
            .http_client
            .request(method.clone(), url)
            .header(AUTHORIZATION, self.authorization()?)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::Timeout { duration: timeout }
            } else {
                QueueError::ConnectionFailed {
                    message: format!("{} {} failed: {}", method, url, e),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = self.error_for_status(status, body, timeout, kind);
        warn!(
            queue_name = %self.queue_name,
            method = %method,
            status = status.as_u16(),
            error = %error,
            "Service Bus request failed"
        );
        Err(error)
    }

    fn error_for_status(
        &self,
        status: StatusCode,
        body: String,
        timeout: Duration,
        kind: RequestKind<'_>,
    ) -> QueueError {
        let detail = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("no detail").to_string()
        } else {
            body.trim().to_string()
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                QueueError::AuthenticationFailed { message: detail }
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => match kind {
                RequestKind::Settle(lock_token) => QueueError::MessageLockLost {
                    lock_token: lock_token.to_string(),
                },
                RequestKind::Send | RequestKind::Receive => QueueError::QueueNotFound {
                    queue_name: self.queue_name.to_string(),
                },
            },
            StatusCode::REQUEST_TIMEOUT => QueueError::Timeout { duration: timeout },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                QueueError::ServerBusy { message: detail }
            }
            status if status.is_server_error() => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code: status.as_u16().to_string(),
                message: detail,
            },
            status => QueueError::InvalidOperation {
                message: format!("request rejected with {}: {}", status.as_u16(), detail),
            },
        }
    }

    fn send_headers(message: &Message) -> Result<HeaderMap, QueueError> {
        let mut headers = HeaderMap::new();

        let broker_properties = serde_json::to_string(&BrokerProperties::for_message(message))?;
        headers.insert(
            HeaderName::from_static("brokerproperties"),
            header_value("BrokerProperties", &broker_properties)?,
        );

        let content_type = message.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        headers.insert(CONTENT_TYPE, header_value("Content-Type", content_type)?);

        for (name, value) in &message.properties {
            let header_name =
                HeaderName::from_str(name).map_err(|e| ValidationError::InvalidFormat {
                    field: format!("property '{}'", name),
                    message: e.to_string(),
                })?;
            let quoted = serde_json::to_string(value)?;
            headers.insert(header_name, header_value(name, &quoted)?);
        }

        Ok(headers)
    }

    async fn read_message(
        response: reqwest::Response,
        mode: ReceiveMode,
    ) -> Result<ReceivedMessage, QueueError> {
        let headers = response.headers().clone();

        let raw_properties = headers
            .get(BROKER_PROPERTIES_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ValidationError::Required {
                field: BROKER_PROPERTIES_HEADER.to_string(),
            })?;
        let broker: BrokerProperties = serde_json::from_str(raw_properties)?;

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.map_err(|e| QueueError::ConnectionFailed {
            message: format!("failed to read message body: {}", e),
        })?;

        let message_id = match broker.message_id.as_deref() {
            Some(id) => MessageId::from_str(id)?,
            None => MessageId::new(),
        };

        let lock_token = match (mode, broker.lock_token.as_deref()) {
            (ReceiveMode::PeekLock, Some(lock)) => {
                Some(LockToken::new(format!("{}/{}", message_id, lock)))
            }
            (ReceiveMode::PeekLock, None) => {
                return Err(ValidationError::Required {
                    field: "BrokerProperties.LockToken".to_string(),
                }
                .into())
            }
            (ReceiveMode::ReceiveAndDelete, _) => None,
        };

        Ok(ReceivedMessage {
            message_id,
            body,
            properties: custom_properties(&headers),
            content_type,
            correlation_id: broker.correlation_id,
            label: broker.label,
            sequence_number: broker.sequence_number.unwrap_or_default(),
            delivery_count: broker.delivery_count.unwrap_or(1),
            enqueued_at: parse_broker_date(broker.enqueued_time_utc.as_deref()),
            locked_until: parse_broker_date(broker.locked_until_utc.as_deref()),
            lock_token,
        })
    }

    async fn settle(
        &self,
        method: Method,
        lock_token: &LockToken,
    ) -> Result<(), QueueError> {
        let url = self.settlement_url(lock_token)?;
        self.execute(
            method,
            &url,
            HeaderMap::new(),
            None,
            DEFAULT_REQUEST_TIMEOUT,
            RequestKind::Settle(lock_token),
        )
        .await?;
        Ok(())
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, QueueError> {
    HeaderValue::from_str(value).map_err(|e| {
        ValidationError::InvalidFormat {
            field: name.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Headers the broker or HTTP stack sets on every response
fn is_reserved_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.eq_ignore_ascii_case(BROKER_PROPERTIES_HEADER)
        || name.starts_with("x-ms-")
        || matches!(
            name,
            "accept-ranges"
                | "age"
                | "cache-control"
                | "connection"
                | "content-encoding"
                | "content-length"
                | "content-location"
                | "content-type"
                | "date"
                | "etag"
                | "expires"
                | "last-modified"
                | "location"
                | "server"
                | "strict-transport-security"
                | "transfer-encoding"
                | "vary"
                | "www-authenticate"
        )
}

/// Custom properties are the non-reserved headers whose value is a JSON string
fn custom_properties(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_reserved_header(name))
        .filter_map(|(name, value)| {
            let raw = value.to_str().ok()?;
            if !raw.starts_with('"') {
                return None;
            }
            let decoded: String = serde_json::from_str(raw).ok()?;
            Some((name.as_str().to_string(), decoded))
        })
        .collect()
}

#[async_trait]
impl QueueProvider for ServiceBusHttpProvider {
    #[instrument(skip(self, message), fields(queue_name = %self.queue_name, message_id = %message.message_id))]
    async fn send(&self, message: &Message) -> Result<(), QueueError> {
        let url = format!("{}/messages", self.queue_url);
        let headers = Self::send_headers(message)?;

        self.execute(
            Method::POST,
            &url,
            headers,
            Some(message.body.clone()),
            DEFAULT_REQUEST_TIMEOUT,
            RequestKind::Send,
        )
        .await?;
        Ok(())
    }

    async fn receive(
        &self,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let method = match mode {
            ReceiveMode::PeekLock => Method::POST,
            ReceiveMode::ReceiveAndDelete => Method::DELETE,
        };
        let server_timeout_secs = timeout
            .as_secs()
            .checked_add(u64::from(timeout.subsec_nanos() > 0))
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("receive timeout {:?} is out of range", timeout),
            })?;
        let url = format!(
            "{}/messages/head?timeout={}",
            self.queue_url, server_timeout_secs
        );

        let response = self
            .execute(
                method,
                &url,
                HeaderMap::new(),
                None,
                timeout.saturating_add(RECEIVE_REQUEST_GRACE),
                RequestKind::Receive,
            )
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let message = Self::read_message(response, mode).await?;
        debug!(
            queue_name = %self.queue_name,
            message_id = %message.message_id,
            sequence_number = message.sequence_number,
            "Message received"
        );
        Ok(Some(message))
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.settle(Method::DELETE, lock_token).await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.settle(Method::PUT, lock_token).await
    }

    async fn dead_letter(&self, _lock_token: &LockToken, _reason: &str) -> Result<(), QueueError> {
        Err(QueueError::NotSupported {
            operation: "dead_letter".to_string(),
            transport: TransportType::Https.to_string(),
        })
    }

    async fn renew_lock(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.settle(Method::POST, lock_token).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn entity_path(&self) -> &QueueName {
        &self.queue_name
    }

    fn transport(&self) -> TransportType {
        TransportType::Https
    }
}

impl fmt::Debug for ServiceBusHttpProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusHttpProvider")
            .field("queue_url", &self.queue_url)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
