//! Wire protocol for the chat socket and HTTP replies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingEnvelope {
    /// User chat text.
    Chat { content: String },
    /// Sent once after the socket opens.
    ConnectionInit { content: String },
    /// Keepalive.
    Ping,
}

impl OutgoingEnvelope {
    #[must_use]
    pub fn chat(content: impl Into<String>) -> Self {
        Self::Chat {
            content: content.into(),
        }
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Message from server to client (socket frame or HTTP body).
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEnvelope {
    /// Assistant answer (`ai_response`, `reply`, `response`, `gemini_response`).
    Response { content: String, insights: Vec<String> },
    /// Assistant is working on an answer.
    Typing,
    /// Server-pushed notice.
    Notification { message: String },
    /// Server-side failure.
    Error { message: String },
    /// Welcome frame sent right after the socket opens.
    ConnectionEstablished { message: Option<String> },
    /// Keepalive answer.
    Pong,
    /// Server confirmed a history clear.
    HistoryCleared,
    /// Anything with an unknown or missing tag.
    Unrecognized(Value),
}

/// Text the user should see, extracted from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// An answer to show as a bot message.
    Answer { content: String, insights: Vec<String> },
    /// A server notice to show as a bot message.
    Notice(String),
    /// A failure to show as a bot error message.
    Failure(String),
}

const CONTENT_FIELDS: [&str; 3] = ["response", "content", "message"];

fn first_string(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|field| obj.get(*field).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_owned)
}

fn insights_of(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("insights") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

impl IncomingEnvelope {
    /// Parse a raw JSON frame.
    ///
    /// # Errors
    /// Returns error if the frame is not valid JSON.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(raw).map(Self::from_value)
    }

    /// Classify a decoded JSON value. The tag is read from `type`, or from
    /// `event` when `type` is absent or not a string.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let obj = match &value {
            Value::Object(obj) => obj,
            _ => return Self::Unrecognized(value),
        };
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| obj.get("event").and_then(Value::as_str))
            .unwrap_or_default();

        match tag {
            "ai_response" | "reply" | "response" | "gemini_response" => Self::Response {
                content: first_string(obj, &CONTENT_FIELDS).unwrap_or_default(),
                insights: insights_of(obj),
            },
            "typing" => Self::Typing,
            "notification" => Self::Notification {
                message: first_string(obj, &["message", "content", "title"]).unwrap_or_default(),
            },
            "error" => Self::Error {
                message: first_string(obj, &["message", "error", "detail"])
                    .unwrap_or_else(|| "Unknown server error".to_string()),
            },
            "connection_established" => Self::ConnectionEstablished {
                message: first_string(obj, &["message"]),
            },
            "pong" => Self::Pong,
            "history_cleared" => Self::HistoryCleared,
            _ => Self::Unrecognized(value),
        }
    }

    /// Whether this variant answers a pending request (clears typing/loading).
    ///
    /// `Unrecognized` settles only when fallback extraction finds text.
    #[must_use]
    pub const fn settles_request(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::Error { .. })
    }

    /// Whether this is the server refusing a `connection_init` envelope
    /// (`Unknown message type: connection_init`). Such frames are not shown.
    #[must_use]
    pub fn rejects_connection_init(&self) -> bool {
        matches!(self, Self::Error { message } if message.contains("connection_init"))
    }

    /// User-visible text carried by this envelope, if any.
    #[must_use]
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Self::Response { content, insights } => {
                (!content.is_empty() || !insights.is_empty())
                    .then_some(Reply::Answer { content, insights })
            }
            Self::Notification { message } => (!message.is_empty()).then_some(Reply::Notice(message)),
            Self::Error { message } => Some(Reply::Failure(message)),
            Self::Unrecognized(Value::Object(obj)) => {
                let content = first_string(&obj, &CONTENT_FIELDS).unwrap_or_default();
                let insights = insights_of(&obj);
                (!content.is_empty() || !insights.is_empty())
                    .then_some(Reply::Answer { content, insights })
            }
            Self::Typing
            | Self::ConnectionEstablished { .. }
            | Self::Pong
            | Self::HistoryCleared
            | Self::Unrecognized(_) => None,
        }
    }
}
