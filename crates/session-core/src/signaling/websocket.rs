//! WebSocket connector for the rendezvous service.
//!
//! Each connection runs two tasks: a writer draining the outbound envelope
//! channel into text frames and a reader decoding frames into the inbound
//! channel. The inbound sender is dropped when the socket closes, which the
//! channel reports as `Disconnected`.

use super::channel::{SignalingConnector, SignalingLink};
use super::error::SignalingError;
use super::messages::Envelope;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// Capacity of the envelope channels in each direction.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingLink, SignalingError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        debug!(target: "vs.signaling.ws", url = %self.url, "WebSocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "vs.signaling.ws", kind = %envelope.kind, error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                if ws_write.send(Message::text(text)).await.is_err() {
                    debug!(target: "vs.signaling.ws", "Writer stopped, socket gone");
                    return;
                }
            }
            // Every sender dropped: the session is done with this connection
            if let Err(e) = ws_write.close().await {
                trace!(target: "vs.signaling.ws", error = %e, "Close handshake failed");
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let envelope = match frame {
                    Ok(Message::Text(text)) => serde_json::from_str::<Envelope>(text.as_str()),
                    Ok(Message::Binary(data)) => serde_json::from_slice::<Envelope>(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(target: "vs.signaling.ws", error = %e, "WebSocket read failed");
                        break;
                    }
                };

                match envelope {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "vs.signaling.ws", error = %e, "Dropping undecodable frame");
                    }
                }
            }
            debug!(target: "vs.signaling.ws", "Reader stopped");
        });

        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_url_is_connect_error() {
        // Port 9 on loopback has nothing listening
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/signal");
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, SignalingError::Connect(_)));
    }

    #[test]
    fn test_url_kept() {
        assert_eq!(
            WebSocketConnector::new("wss://rendezvous.example.com/ws").url(),
            "wss://rendezvous.example.com/ws"
        );
    }
}
