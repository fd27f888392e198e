//! Seams between the transport state machine and the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ChatMode;

/// Event delivered by an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Text frame (binary frames are delivered here if valid UTF-8).
    Frame(String),
    /// Transport-level error. A `Closed` event follows.
    Error(String),
    /// The socket closed.
    Closed { code: Option<u16>, reason: String },
}

/// An open socket.
///
/// Dropping `outbound` asks the connector to close the socket.
pub struct SocketLink {
    /// Text frames to send.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames and lifecycle events from the peer.
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Socket open error.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("Invalid socket URL: {0}")]
    InvalidUrl(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Trait for socket implementations.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url`. Resolves once the socket is open.
    async fn connect(&self, url: &str) -> Result<SocketLink, ConnectError>;
}

/// Body of a fallback chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub query: String,
}

/// Assistant availability, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceStatus {
    pub available: bool,
    pub configured: bool,
    pub api_key_set: bool,
    pub message: String,
}

/// Server-side conversation memory for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSummary {
    pub message_count: usize,
    pub last_conversation: Option<Value>,
    pub conversation_topics: Vec<String>,
}

/// HTTP backend error.
///
/// The `Display` text is shown to the user in error chat messages.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request failed ({status}): {detail}")]
    Status { status: u16, detail: String },
    #[error("Invalid response from server: {0}")]
    Decode(String),
    #[error("Server rejected the request: {0}")]
    Rejected(String),
}

/// Trait for request/response chat backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send one chat query and return the raw JSON reply.
    async fn chat(&self, mode: ChatMode, request: &ChatRequest) -> Result<Value, BackendError>;

    /// Drop the server-side conversation memory for a session.
    async fn clear_history(&self, session_id: &str) -> Result<(), BackendError>;

    /// Report whether the assistant is configured and reachable.
    async fn status(&self) -> Result<ServiceStatus, BackendError>;

    /// Summarize the server-side conversation memory for a session.
    async fn conversation_summary(
        &self,
        session_id: &str,
    ) -> Result<ConversationSummary, BackendError>;
}
