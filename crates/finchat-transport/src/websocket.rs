//! WebSocket connector backed by `tokio-tungstenite`.

use async_trait::async_trait;
use finchat_core::{ConnectError, SocketConnector, SocketEvent, SocketLink};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Opens real WebSocket connections.
///
/// Each link gets a writer task (outbound channel → socket) and a reader
/// task (socket → inbound channel). Dropping every outbound sender makes
/// the writer send a close frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketLink, ConnectError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectError::InvalidUrl(url.to_string()));
        }

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // Forward outbound frames until every sender is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!("WebSocket send failed: {e}");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        let _ = in_tx.send(SocketEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                        break;
                    }
                };
                if in_tx.send(SocketEvent::Frame(text)).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(SocketEvent::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
        });

        Ok(SocketLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
