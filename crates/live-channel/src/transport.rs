//! Transport seam and the WebSocket implementation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::credentials::Token;
use crate::error::TransportError;
use crate::protocol::{decode_frame, encode_frame};
use crate::types::{Inbound, Outbound};

/// Opens the shared channel. One call per connection attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, token: &Token) -> Result<Box<dyn Channel>, TransportError>;
}

/// An open channel, exclusively owned by the manager's session task.
#[async_trait]
pub trait Channel: Send {
    /// Next inbound frame. `None` means the peer closed the channel.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    async fn send(&mut self, frame: Outbound) -> Result<(), TransportError>;

    /// Liveness probe; the answer arrives as [`Inbound::Heartbeat`].
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// JSON-over-WebSocket transport. The token travels as the `access_token`
/// query parameter.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn build_ws_url(base: &str, token: &str) -> Result<String, TransportError> {
    let mut u = url::Url::parse(base)?;
    u.query_pairs_mut().append_pair("access_token", token);
    Ok(u.to_string())
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, token: &Token) -> Result<Box<dyn Channel>, TransportError> {
        let url = build_ws_url(&self.url, token.as_str())?;
        let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(WsChannel { ws }))
    }
}

struct WsChannel {
    ws: WsStream,
}

#[async_trait]
impl Channel for WsChannel {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let text = match self.ws.next().await? {
                Ok(tungstenite::Message::Text(text)) => text.as_str().to_owned(),
                Ok(tungstenite::Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Ignoring non-UTF-8 binary frame: {e}");
                        continue;
                    }
                },
                Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)) => {
                    return Some(Ok(Inbound::Heartbeat));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    tracing::debug!(?frame, "Close frame received");
                    return None;
                }
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            match decode_frame(&text) {
                Ok(event) => return Some(Ok(Inbound::Event(event))),
                Err(e) => {
                    // A bad frame never drops the channel.
                    tracing::warn!("Failed to decode frame: {e}");
                }
            }
        }
    }

    async fn send(&mut self, frame: Outbound) -> Result<(), TransportError> {
        let text = encode_frame(&frame)?;
        self.ws.send(tungstenite::Message::Text(text.into())).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.ws
            .send(tungstenite::Message::Ping(Vec::new().into()))
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!("Error while closing WebSocket: {e}");
        }
    }
}
