//! Core types for the finance assistant chat transport.
//!
//! This crate provides the fundamental building blocks:
//! - `ChatMessage` - Immutable transcript entries
//! - `Transcript` - Append-only history + live subscription
//! - `ConnectionState` / `ReconnectPolicy` - Socket lifecycle bookkeeping
//! - `TransportConfig` - File + environment configuration
//! - `SocketConnector` and `ChatBackend` traits

pub mod config;
pub mod message;
pub mod state;
pub mod traits;
pub mod transcript;

pub use config::{ChatMode, ConfigError, ReconnectConfig, TransportConfig, path_segment};
pub use message::{ChatMessage, Role};
pub use state::{ConnectionState, ReconnectPolicy};
pub use traits::{
    BackendError, ChatBackend, ChatRequest, ConnectError, ConversationSummary, ServiceStatus,
    SocketConnector, SocketEvent, SocketLink,
};
pub use transcript::{Transcript, TranscriptEvent};
