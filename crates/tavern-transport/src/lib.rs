//! Resilient duplex transport for the tavern simulation.
//!
//! Provides:
//! - [`Channel`]: one connection with handshake, heartbeat, reconnection
//!   with exponential backoff, correlated requests and typed events
//! - Outbound queue for frames produced while disconnected
//! - Wire protocol (JSON text frames)
//! - Physical links: WebSocket (feature: websocket) and in-memory

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod link;
pub mod pending;
pub mod protocol;
pub mod queue;

pub use channel::Channel;
pub use config::{HeartbeatConfig, ReconnectConfig, TransportConfig};
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{ProtocolError, QueueError, RequestError, TransportError};
pub use events::{ChannelEvent, EventKind, SubscriptionId};
pub use link::{Connector, Link, LinkError, MemoryConnector};
#[cfg(feature = "websocket")]
pub use link::WebSocketConnector;
pub use pending::ResponseFuture;
pub use protocol::{Frame, InboundEvent};
