//! In-memory link.
//!
//! Useful for tests and for embedding a simulated server in-process.
//! Every successful `connect` hands the server side of the link, a
//! [`MemoryPeer`], to the [`MemoryListener`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, channel::mpsc};
use tokio::sync::mpsc as tokio_mpsc;

use super::{Connector, Link, LinkError};
use crate::protocol::Frame;

/// How the connector answers the next connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptMode {
    /// Open a link.
    #[default]
    Accept,
    /// Fail immediately.
    Refuse,
    /// Never answer (exercises the connect timeout).
    Hang,
}

#[derive(Debug, Default)]
struct ConnectorState {
    mode: AcceptMode,
    attempts: u32,
}

/// In-memory connector.
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: tokio_mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    /// Create a connector and the listener receiving server-side peers.
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (peers, incoming) = tokio_mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            peers,
        };
        (connector, MemoryListener { incoming })
    }

    /// Change how future attempts are answered.
    pub fn set_mode(&self, mode: AcceptMode) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mode = mode;
    }

    /// Connection attempts seen so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError> {
        let mode = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.attempts += 1;
            state.mode
        };

        match mode {
            AcceptMode::Accept => {}
            AcceptMode::Refuse => {
                return Err(LinkError::Refused(format!("{endpoint} refused the connection")));
            }
            AcceptMode::Hang => std::future::pending::<()>().await,
        }

        let (client_tx, server_rx) = mpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<String, LinkError>>();

        let peer = MemoryPeer {
            endpoint: endpoint.to_owned(),
            tx: server_tx,
            rx: server_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| LinkError::Refused("memory listener dropped".into()))?;

        Ok(Link::new(
            Box::pin(client_tx.sink_map_err(|_| LinkError::Closed)),
            client_rx.boxed(),
        ))
    }
}

/// Receives the server side of each accepted link.
pub struct MemoryListener {
    incoming: tokio_mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next accepted link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Server side of an in-memory link. Dropping it closes the link.
pub struct MemoryPeer {
    endpoint: String,
    tx: mpsc::UnboundedSender<Result<String, LinkError>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Endpoint the client asked for.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send raw text to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Send a frame to the client.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        frame.encode().is_ok_and(|text| self.send_text(text))
    }

    /// Break the link with an error.
    pub fn fail(&self, error: LinkError) -> bool {
        self.tx.unbounded_send(Err(error)).is_ok()
    }

    /// Next raw text from the client; `None` once the client closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.rx.next().await
    }

    /// Next decodable frame from the client.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        while let Some(text) = self.recv_text().await {
            match Frame::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!("Memory peer skipped undecodable text: {e}"),
            }
        }
        None
    }

    /// Next frame of type `kind`, skipping everything else.
    pub async fn recv_frame_of(&mut self, kind: &str) -> Option<Frame> {
        while let Some(frame) = self.recv_frame().await {
            if frame.kind == kind {
                return Some(frame);
            }
        }
        None
    }

    /// Frame already buffered, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Frame> {
        let text = self.rx.try_recv().ok()?;
        Frame::decode(&text).ok()
    }
}
