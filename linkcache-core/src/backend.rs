//! Remote linking backend client
//!
//! Provides a `LinkBackend` trait with one implementation:
//! - **HttpLinkBackend**: the channel-linking service over HTTP/JSON
//!
//! Transport problems (connect failures, timeouts) surface as [`BackendError`].
//! Any HTTP answer, success or not, comes back as a [`RemoteReply`] so callers
//! can decide what a given status code means. Response bodies that are empty or
//! not JSON decode to `{}` and set [`RemoteReply::malformed`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::extract::unwrap_payload;

// ============================================================================
// LinkBackend trait
// ============================================================================

/// Abstraction over the remote service that owns channel sessions.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Read-only link status for `agent_id`.
    async fn session_status(&self, agent_id: &str) -> Result<RemoteReply, BackendError>;

    /// Read-only session detail (QR artifact included) for `agent_id`.
    async fn session_detail(&self, agent_id: &str) -> Result<RemoteReply, BackendError>;

    /// Start a fresh link handshake for `agent_id`.
    async fn reconnect(&self, agent_id: &str) -> Result<RemoteReply, BackendError>;

    /// Create a session for a new agent.
    async fn create_session(&self, request: &CreateSessionRequest)
        -> Result<RemoteReply, BackendError>;

    /// Base URL, for diagnostics.
    fn base_url(&self) -> &str;
}

// ============================================================================
// Types
// ============================================================================

/// An HTTP answer from the remote backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    pub status: u16,
    /// Decoded body; always a JSON object.
    pub payload: Value,
    /// The body was empty or could not be decoded.
    pub malformed: bool,
}

impl RemoteReply {
    pub fn new(status: u16, payload: Value) -> Self {
        Self {
            status,
            payload: unwrap_payload(payload),
            malformed: false,
        }
    }

    /// Decode a raw body, falling back to `{}`.
    pub fn from_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::new(status, value),
            Err(_) => Self {
                status,
                payload: Value::Object(Default::default()),
                malformed: true,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable reason from a failure payload.
    pub fn detail(&self) -> Option<String> {
        if let Some(detail) = self.payload.get("detail").and_then(Value::as_str) {
            return Some(detail.to_string());
        }
        ["message", "error"].iter().find_map(|key| {
            self.payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent_id: String,
    pub agent_name: String,
    pub api_key: String,
    /// Endpoint the session service calls to run the agent.
    #[serde(rename = "langchainUrl")]
    pub execute_url: String,
}

impl fmt::Debug for CreateSessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateSessionRequest")
            .field("agent_id", &self.agent_id)
            .field("agent_name", &self.agent_name)
            .field("api_key", &"<redacted>")
            .field("execute_url", &self.execute_url)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentBody<'a> {
    agent_id: &'a str,
}

/// Transport-level failures talking to the backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Remote backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote backend unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
}

// ============================================================================
// HttpLinkBackend
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpLinkBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpLinkBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Self::with_base_url(
            config.base_url.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    /// Create a client against an explicit base URL (tests / integration).
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BackendError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<RemoteReply, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Err(BackendError::Timeout(self.timeout)),
            Err(e) => {
                tracing::warn!(status, error = %e, "Failed to read remote body, treating as empty");
                String::new()
            }
        };

        let reply = RemoteReply::from_body(status, &body);
        if reply.malformed && !body.trim().is_empty() {
            tracing::warn!(status, "Remote body is not JSON, treating as empty object");
        }
        Ok(reply)
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Unreachable(e)
        }
    }
}

#[async_trait]
impl LinkBackend for HttpLinkBackend {
    async fn session_status(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
        let request = self
            .client
            .get(self.url("/sessions/status"))
            .query(&[("agentId", agent_id)]);
        self.execute(request).await
    }

    async fn session_detail(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
        let request = self
            .client
            .get(self.url("/sessions/detail"))
            .query(&[("agentId", agent_id)]);
        self.execute(request).await
    }

    async fn reconnect(&self, agent_id: &str) -> Result<RemoteReply, BackendError> {
        let request = self
            .client
            .post(self.url("/sessions/reconnect"))
            .json(&AgentBody { agent_id });
        self.execute(request).await
    }

    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<RemoteReply, BackendError> {
        let request = self.client.post(self.url("/sessions/create")).json(request);
        self.execute(request).await
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

// ============================================================================
// TESTS
// ============================================================================
