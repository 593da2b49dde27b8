//! WebSocket link over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};

use super::{Connector, Link, LinkError};

/// Opens `ws://` / `wss://` links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError> {
        let (socket, _response) = connect_async(endpoint)
            .await
            .map_err(|e| LinkError::Refused(e.to_string()))?;
        tracing::debug!(%endpoint, "WebSocket link open");

        let (sink, stream) = socket.split();

        let sink = sink
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text.into()))))
            .sink_map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => LinkError::Closed,
                other => LinkError::Io(other.to_string()),
            });

        // Control frames are answered by tungstenite itself.
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| LinkError::Io(format!("non UTF-8 binary frame: {e}"))),
                ),
                Ok(Message::Close(_)) => Some(Err(LinkError::Closed)),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(LinkError::Io(e.to_string()))),
            })
        });

        Ok(Link::new(Box::pin(sink), stream.boxed()))
    }
}
