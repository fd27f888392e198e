//! Transcript entries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Typed by the local user.
    User,
    /// Produced by the remote assistant (or an error standing in for it).
    Bot,
    /// Local greeting / housekeeping text.
    System,
}

/// A single chat message.
///
/// Fields are private so a message cannot change after it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    id: Uuid,
    role: Role,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    insights: Vec<String>,
    /// Unix epoch milliseconds.
    timestamp: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl ChatMessage {
    /// Create a message stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>, insights: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            insights,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, Vec::new())
    }

    #[must_use]
    pub fn bot(content: impl Into<String>, insights: Vec<String>) -> Self {
        Self::new(Role::Bot, content, insights)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, Vec::new())
    }

    /// Bot-role message describing a failure.
    #[must_use]
    pub fn error(summary: impl std::fmt::Display) -> Self {
        Self::new(
            Role::Bot,
            format!("Sorry, something went wrong: {summary}"),
            Vec::new(),
        )
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn insights(&self) -> &[String] {
        &self.insights
    }

    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }
}
