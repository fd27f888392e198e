//! Chat transport for the finance assistant.
//!
//! Provides:
//! - Wire protocol (JSON envelopes keyed by `type`/`event`)
//! - `ChatTransport` - socket lifecycle, reconnect backoff, HTTP fallback
//! - WebSocket connector (feature: websocket)
//! - HTTP backend (feature: http)

pub mod chat;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "http")]
pub mod http;

pub use chat::{ChatTransport, SendOutcome};
pub use protocol::{IncomingEnvelope, OutgoingEnvelope, Reply};

#[cfg(feature = "http")]
pub use http::HttpBackend;
#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
