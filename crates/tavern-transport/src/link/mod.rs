//! Physical links.
//!
//! A [`Connector`] opens a [`Link`]: a sink of outgoing text frames and a
//! stream of incoming ones. The channel never sees anything below that.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, stream::BoxStream};
use thiserror::Error;

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{AcceptMode, MemoryConnector, MemoryListener, MemoryPeer};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Link error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Link I/O error: {0}")]
    Io(String),
}

/// Outgoing half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;

/// Incoming half of a link. The stream ends when the peer goes away.
pub type FrameStream = BoxStream<'static, Result<String, LinkError>>;

/// An open duplex link.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    /// Bundle both halves.
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Trait for physical link factories.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError>;
}
