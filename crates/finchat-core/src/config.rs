//! Transport configuration.
//!
//! Loaded from `<config dir>/finchat/config.json` when present, then
//! overridden by `FINCHAT_*` environment variables.

use std::{
    borrow::Cow,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Which HTTP chat endpoint the fallback path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Rule-based conversational agent (`/api/chat`).
    Agent,
    /// Gemini-backed assistant (`/api/gemini/chat`).
    #[default]
    Gemini,
}

impl ChatMode {
    /// Path of the chat endpoint relative to the API base.
    #[must_use]
    pub const fn chat_path(self) -> &'static str {
        match self {
            Self::Agent => "/api/chat",
            Self::Gemini => "/api/gemini/chat",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Gemini => f.write_str("gemini"),
        }
    }
}

impl FromStr for ChatMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Ok(Self::Agent),
            "gemini" => Ok(Self::Gemini),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Unknown chat mode: {0}")]
    InvalidMode(String),
}

/// Settings for a chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL for HTTP calls, e.g. `http://localhost:8000`.
    pub api_base_url: String,
    /// Base URL for sockets. Derived from `api_base_url` when unset.
    pub socket_base_url: Option<String>,
    /// HTTP chat endpoint used by the fallback path.
    pub mode: ChatMode,
    /// Whether the real-time socket is used at all.
    pub realtime: bool,
    /// Send a `connection_init` envelope right after the socket opens.
    /// Off by default; the stock backend answers it with an error frame.
    pub send_connection_init: bool,
    pub reconnect: ReconnectConfig,
    /// Interval for `ping` keepalives; disabled when unset.
    pub keepalive_secs: Option<u64>,
    pub request_timeout_secs: u64,
    /// Seed message for a new or cleared transcript.
    pub greeting: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            socket_base_url: None,
            mode: ChatMode::default(),
            realtime: true,
            send_connection_init: false,
            reconnect: ReconnectConfig::default(),
            keepalive_secs: None,
            request_timeout_secs: 30,
            greeting: "Hi! I'm your finance assistant. Ask me about your spending, budgets, or savings."
                .to_string(),
        }
    }
}

impl TransportConfig {
    /// Load from the default config file (if any), then apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the config file exists but cannot be read or parsed,
    /// or if an override holds an invalid value.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid JSON.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Location of the config file.
    ///
    /// # Errors
    /// Returns error if the platform has no config directory.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("finchat").join("config.json"))
    }

    /// Apply `FINCHAT_API_URL`, `FINCHAT_WS_URL`, `FINCHAT_MODE` and `FINCHAT_REALTIME`.
    ///
    /// # Errors
    /// Returns error if `FINCHAT_MODE` names an unknown mode.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("FINCHAT_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("FINCHAT_WS_URL") {
            self.socket_base_url = Some(url);
        }
        if let Some(mode) = lookup("FINCHAT_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(flag) = lookup("FINCHAT_REALTIME") {
            self.realtime = !matches!(flag.trim(), "0" | "false" | "off" | "no");
        }
        Ok(())
    }

    /// Base URL for sockets, without a trailing slash.
    #[must_use]
    pub fn socket_base(&self) -> String {
        if let Some(base) = &self.socket_base_url {
            return base.trim_end_matches('/').to_string();
        }
        let api = self.api_base();
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            api.to_string()
        }
    }

    /// Base URL for HTTP calls, without a trailing slash.
    #[must_use]
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// Per-session socket endpoint.
    #[must_use]
    pub fn socket_url(&self, session_id: &str) -> String {
        format!("{}/ws/{}", self.socket_base(), path_segment(session_id))
    }
}

/// Percent-encode `raw` for use as one URL path segment.
///
/// Only RFC 3986 unreserved bytes pass through, so `/`, `?`, `#` and spaces
/// in a session id can't change which endpoint is addressed.
#[must_use]
pub fn path_segment(raw: &str) -> Cow<'_, str> {
    let unreserved = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~');
    if raw.bytes().all(unreserved) {
        return Cow::Borrowed(raw);
    }
    let mut encoded = String::with_capacity(raw.len() * 3);
    for b in raw.bytes() {
        if unreserved(b) {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    Cow::Owned(encoded)
}
