//! HTTP chat backend backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use finchat_core::{
    BackendError, ChatBackend, ChatMode, ChatRequest, ConversationSummary, ServiceStatus,
    TransportConfig, path_segment,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// REST client for the finance backend's chat endpoints.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend for `base_url` with a per-request timeout.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a backend from transport settings.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn from_config(config: &TransportConfig) -> Result<Self, BackendError> {
        Self::new(
            config.api_base(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                detail: error_detail(&body).unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("unexpected status")
                        .to_string()
                }),
            });
        }

        serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Pull a readable message out of an error body (`detail` is FastAPI's field).
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["detail", "error", "message"]
        .iter()
        .find_map(|field| match value.get(*field)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn chat(&self, mode: ChatMode, request: &ChatRequest) -> Result<Value, BackendError> {
        tracing::debug!(%mode, user_id = %request.user_id, "sending chat over HTTP");
        let response = self
            .client
            .post(self.url(mode.chat_path()))
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn clear_history(&self, session_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url(&format!(
                "/api/gemini/clear-history/{}",
                path_segment(session_id)
            )))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let body: Value = Self::read_json(response).await?;

        // The backend answers 200 with an `error` field when the clear fails.
        match body.get("error").and_then(Value::as_str) {
            Some(error) => Err(BackendError::Rejected(error.to_string())),
            None => Ok(()),
        }
    }

    async fn status(&self) -> Result<ServiceStatus, BackendError> {
        let response = self
            .client
            .get(self.url("/api/gemini/status"))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn conversation_summary(
        &self,
        session_id: &str,
    ) -> Result<ConversationSummary, BackendError> {
        let response = self
            .client
            .get(self.url(&format!(
                "/api/gemini/conversation-summary/{}",
                path_segment(session_id)
            )))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let body: Value = Self::read_json(response).await?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(BackendError::Rejected(error.to_string()));
        }
        serde_json::from_value(body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}
