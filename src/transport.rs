//! HTTP transport for the gateway's REST endpoints.
//!
//! [`Transport`] is the seam the supervisor talks to; [`HttpTransport`] is the
//! `reqwest` implementation. Every call is a single request against the
//! [`Endpoint`] snapshot it is given: no retries, no cached state. Retry policy
//! belongs to the caller.
//!
//! ## Endpoints
//!
//! | Method | Path                   | Returns                      |
//! |--------|------------------------|------------------------------|
//! | GET    | `/status`              | raw status JSON              |
//! | GET    | `/sessions`            | `[{key, label, active}]`     |
//! | GET    | `/messages?limit=N`    | `[{content, timestamp, fromMe}]` |
//! | POST   | `/chat`                | raw result JSON              |
//!
//! All requests carry `X-API-Secret` when a secret is configured.
//!
//! ## Timeouts
//!
//! `test_connection` is bounded to [`TEST_TIMEOUT`]. The other calls have only
//! a connect timeout; callers bound them by dropping the future.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Endpoint;

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "X-API-Secret";

/// Upper bound for a connection test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for local gateway detection.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(2);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One gateway session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// Message timestamps arrive either as epoch millis or as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub from_me: bool,
}

/// Failure of a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, timeout, broken body stream.
    #[error("network error: {0}")]
    Network(String),
    /// The gateway answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// The body was not the JSON we expected.
    #[error("decode error: {0}")]
    Decode(String),
    /// The configured base URL cannot be used to build a request.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Http { status: 401, .. })
    }
}

/// Request/response access to the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `GET /status`.
    async fn status(&self, endpoint: &Endpoint) -> Result<Value, TransportError>;

    /// `GET /sessions`.
    async fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<SessionRecord>, TransportError>;

    /// `GET /messages?limit=N`, capped to `limit` entries.
    async fn messages(
        &self,
        endpoint: &Endpoint,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TransportError>;

    /// `POST /chat` with `{message, target?}`.
    async fn send_message(
        &self,
        endpoint: &Endpoint,
        text: &str,
        target: Option<&str>,
    ) -> Result<Value, TransportError>;

    /// `GET /status` bounded by [`TEST_TIMEOUT`].
    async fn test_connection(&self, endpoint: &Endpoint) -> Result<Value, TransportError>;
}

/// `reqwest`-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-clawdbot-client"),
            reqwest::header::HeaderValue::from_static("companion"),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    fn get(&self, endpoint: &Endpoint, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}{path}", endpoint.api_base)), endpoint)
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &Endpoint,
    ) -> reqwest::RequestBuilder {
        match &endpoint.secret {
            Some(secret) => request.header(SECRET_HEADER, secret),
            None => request,
        }
    }

    /// Parse an HTTP response: the JSON body on success, otherwise the
    /// `error` field of a JSON body, falling back to the raw text.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, TransportError> {
        let status = resp.status();
        let body = resp.text().await.map_err(request_error)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| TransportError::Decode(format!("invalid JSON from gateway: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(TransportError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn status(&self, endpoint: &Endpoint) -> Result<Value, TransportError> {
        let resp = self
            .get(endpoint, "/status")
            .send()
            .await
            .map_err(request_error)?;
        Self::handle_response(resp).await
    }

    async fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<SessionRecord>, TransportError> {
        let resp = self
            .get(endpoint, "/sessions")
            .send()
            .await
            .map_err(request_error)?;
        decode_list(Self::handle_response(resp).await?, "sessions")
    }

    async fn messages(
        &self,
        endpoint: &Endpoint,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        let mut url = reqwest::Url::parse(&format!("{}/messages", endpoint.api_base))
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", endpoint.api_base)))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());

        let resp = self
            .authorize(self.http.get(url), endpoint)
            .send()
            .await
            .map_err(request_error)?;
        let mut messages: Vec<MessageRecord> =
            decode_list(Self::handle_response(resp).await?, "messages")?;
        messages.truncate(limit);
        Ok(messages)
    }

    async fn send_message(
        &self,
        endpoint: &Endpoint,
        text: &str,
        target: Option<&str>,
    ) -> Result<Value, TransportError> {
        let mut body = serde_json::json!({ "message": text });
        if let Some(t) = target {
            body["target"] = serde_json::json!(t);
        }

        let resp = self
            .authorize(
                self.http.post(format!("{}/chat", endpoint.api_base)),
                endpoint,
            )
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        Self::handle_response(resp).await
    }

    async fn test_connection(&self, endpoint: &Endpoint) -> Result<Value, TransportError> {
        let resp = self
            .get(endpoint, "/status")
            .timeout(TEST_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;
        Self::handle_response(resp).await
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::InvalidUrl(e.to_string())
    } else if e.is_timeout() {
        TransportError::Network("request timed out".to_string())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Accept either a bare array or an object wrapping it under `field`.
fn decode_list<T: serde::de::DeserializeOwned>(
    value: Value,
    field: &str,
) -> Result<Vec<T>, TransportError> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map.remove(field).ok_or_else(|| {
            TransportError::Decode(format!("expected an array or an object with `{field}`"))
        })?,
        other => {
            return Err(TransportError::Decode(format!(
                "expected an array of {field}, got {other}"
            )))
        }
    };
    serde_json::from_value(list).map_err(|e| TransportError::Decode(format!("{field}: {e}")))
}

/// Result of probing for a gateway on this machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayProbe {
    pub running: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<Value>,
}

/// Probe `http://localhost:<port>/status` (2 s timeout). Any failure means
/// "not running".
pub async fn detect_gateway(port: u16) -> GatewayProbe {
    let not_running = GatewayProbe {
        running: false,
        port,
        version: None,
        uptime: None,
    };
    let Ok(http) = reqwest::Client::builder().timeout(DETECT_TIMEOUT).build() else {
        return not_running;
    };
    let resp = match http
        .get(format!("http://localhost:{port}/status"))
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            tracing::debug!("gateway probe on port {port}: HTTP {}", r.status());
            return not_running;
        }
        Err(e) => {
            tracing::debug!("gateway probe on port {port} failed: {e}");
            return not_running;
        }
    };
    let status: Value = resp.json().await.unwrap_or(Value::Null);
    GatewayProbe {
        running: true,
        port,
        version: status["version"].as_str().map(String::from),
        uptime: status.get("uptime").cloned(),
    }
}
