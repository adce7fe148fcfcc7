//! WebSocket relay link
//!
//! Client side of the rendezvous protocol over `tokio-tungstenite`. Frames
//! are JSON text messages; ping/pong is handled by the library.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::protocol::{ClientFrame, ServerFrame};
use super::RelayLink;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay link over a WebSocket connection
pub struct WsLink {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsLink {
    /// Connect to a relay at `url` (ws:// or wss://)
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingError(format!("Failed to connect to relay: {}", e)))?;
        debug!("Connected to relay at {}", url);

        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait::async_trait]
impl RelayLink for WsLink {
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        let json = serde_json::to_string(&frame)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize frame: {}", e)))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::SignalingError(format!("Relay send failed: {}", e)))
    }

    async fn recv(&self) -> Option<ServerFrame> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        warn!("Dropping malformed relay frame: {}", e);
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {
                    // Ping/pong and binary frames are not part of the protocol
                }
                Err(e) => {
                    warn!("Relay stream error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}
