//! Transport channel.
//!
//! A [`Channel`] is a cheap, cloneable handle. All connection state lives in
//! a single driver task that handles commands, inbound frames and timer
//! ticks one at a time:
//!
//! ```text
//! Channel handles ──commands──► Driver ──frames──► Link ──► server
//!                                  │ ◄──frames──── Link ◄──
//!                                  ├─► PendingRequests (responses by id)
//!                                  └─► SubscriberRegistry (everything else)
//! ```

use std::{
    future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{FutureExt, SinkExt, StreamExt, future::BoxFuture};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::{
    backoff::{Reconnector, RetryDecision},
    config::TransportConfig,
    connection::{Connection, ConnectionStatus},
    error::{RequestError, TransportError},
    events::{self, ChannelEvent, EventKind, SubscriberRegistry, SubscriptionId},
    heartbeat::{HeartbeatAction, HeartbeatMonitor},
    link::{Connector, Link, LinkError},
    pending::{PendingRequests, Reply, ResponseFuture},
    protocol::{Frame, InboundEvent, kinds},
    queue::OutboundQueue,
};

enum Command {
    Connect {
        endpoint: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Send(Frame),
    Request {
        frame: Frame,
        timeout: Duration,
        tx: oneshot::Sender<Reply>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a transport channel.
///
/// The driver task stops when [`Channel::shutdown`] is called or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
    subscribers: Arc<Mutex<SubscriberRegistry>>,
    status: watch::Receiver<ConnectionStatus>,
    request_timeout: Duration,
}

impl Channel {
    /// Spawn a channel driver on the current tokio runtime.
    #[must_use]
    pub fn spawn<C: Connector>(config: TransportConfig, connector: C) -> Self {
        Self::spawn_shared(config, Arc::new(connector))
    }

    /// Spawn a channel driver sharing an existing connector.
    #[must_use]
    pub fn spawn_shared(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Mutex::new(SubscriberRegistry::new()));
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let request_timeout = config.request_timeout();

        let driver = Driver::new(config, connector, Arc::clone(&subscribers), status_tx);
        tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            subscribers,
            status,
            request_timeout,
        }
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::DriverStopped)
    }

    /// Open the link to `endpoint`.
    ///
    /// Resolves once the link is up, the handshake is written and the
    /// outbound queue is flushed.
    ///
    /// # Errors
    /// `Connection` if the link cannot be opened within the connect timeout,
    /// `AlreadyConnecting` if an attempt is in flight.
    pub async fn connect(&self, endpoint: impl Into<String>) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            endpoint: endpoint.into(),
            reply,
        })?;
        rx.await.map_err(|_| TransportError::DriverStopped)?
    }

    /// Send a frame, or queue it while disconnected.
    ///
    /// Frames rejected by a full queue are logged and counted, not reported.
    ///
    /// # Errors
    /// Returns error only if the driver has stopped.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.command(Command::Send(frame))
    }

    /// Send an unsolicited frame of type `kind`.
    ///
    /// # Errors
    /// Returns error only if the driver has stopped.
    pub fn emit(&self, kind: impl Into<String>, payload: Value) -> Result<(), TransportError> {
        self.send(Frame::new(kind, payload))
    }

    /// Send a correlated request with the configured default deadline.
    pub fn request(&self, kind: impl Into<String>, payload: Value) -> ResponseFuture {
        self.request_with_timeout(kind, payload, self.request_timeout)
    }

    /// Send a correlated request.
    ///
    /// The request is registered before this returns; the future settles
    /// exactly once with the response payload or a [`RequestError`].
    pub fn request_with_timeout(
        &self,
        kind: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let frame = Frame::request(kind, Uuid::new_v4().to_string(), payload);
        match self.command(Command::Request { frame, timeout, tx }) {
            Ok(()) => ResponseFuture::new(rx),
            Err(_) => ResponseFuture::closed(),
        }
    }

    /// Register a handler for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(kind, events::handler(f))
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe(id)
    }

    /// Close the link on purpose.
    ///
    /// Pending requests fail with `ConnectionClosed`, the outbound queue is
    /// cleared and no reconnection happens until `connect` is called again.
    ///
    /// # Errors
    /// Returns error if the driver has stopped.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply })?;
        rx.await.map_err(|_| TransportError::DriverStopped)
    }

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current diagnostics snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Stream of diagnostics snapshots, starting with the current one.
    #[must_use]
    pub fn watch_status(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.status.clone())
    }

    /// Whether the link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// In-flight connection attempt.
struct Attempt {
    future: BoxFuture<'static, Result<Link, TransportError>>,
    /// Present when the attempt came from an explicit `connect`.
    reply: Option<oneshot::Sender<Result<(), TransportError>>>,
}

struct Driver {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    connection: Connection,
    queue: OutboundQueue,
    pending: PendingRequests,
    heartbeat: HeartbeatMonitor,
    reconnector: Reconnector,
    attempt: Option<Attempt>,
    lost_notified: bool,
    subscribers: Arc<Mutex<SubscriberRegistry>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Driver {
    fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        subscribers: Arc<Mutex<SubscriberRegistry>>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            queue: OutboundQueue::new(config.queue_capacity),
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat.interval(),
                config.heartbeat.timeout(),
            ),
            reconnector: Reconnector::new(config.reconnect.clone()),
            config,
            connector,
            connection: Connection::new(),
            pending: PendingRequests::new(),
            attempt: None,
            lost_notified: false,
            subscribers,
            status,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.disconnect().await;
                        self.publish_status();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                result = next_attempt(&mut self.attempt) => self.attempt_finished(result).await,
                incoming = next_incoming(&mut self.connection) => self.handle_incoming(incoming),
                () = wait_until(deadline) => self.tick().await,
            }
            self.publish_status();
        }
        tracing::debug!("Channel driver stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let retry = if self.attempt.is_none() {
            self.reconnector.next_retry_at()
        } else {
            None
        };
        [
            self.pending.next_deadline(),
            self.heartbeat.next_deadline(),
            retry,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => self.connect(endpoint, reply).await,
            Command::Send(frame) => self.write_or_queue(frame).await,
            Command::Request { frame, timeout, tx } => {
                let id = frame.id.clone().unwrap_or_default();
                self.pending
                    .insert(id, frame.kind.clone(), timeout, Instant::now(), tx);
                self.write_or_queue(frame).await;
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            // Handled in `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn connect(
        &mut self,
        endpoint: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    ) {
        if self.attempt.is_some() {
            let _ = reply.send(Err(TransportError::AlreadyConnecting));
            return;
        }
        if self.connection.is_connected() {
            if self.connection.endpoint() == Some(endpoint.as_str()) {
                let _ = reply.send(Ok(()));
                return;
            }
            tracing::info!(%endpoint, "Switching endpoint; closing current link");
            self.disconnect().await;
        }

        self.reconnector.reset();
        self.lost_notified = false;
        self.start_attempt(endpoint, Some(reply));
    }

    fn start_attempt(
        &mut self,
        endpoint: String,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) {
        self.connection.begin_connecting(&endpoint);
        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout();

        let future = async move {
            let result = tokio::time::timeout(timeout, connector.connect(&endpoint)).await;
            match result {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(e)) => Err(TransportError::Connection {
                    endpoint,
                    reason: e.to_string(),
                }),
                Err(_) => Err(TransportError::Connection {
                    reason: format!("no link within {}ms", timeout.as_millis()),
                    endpoint,
                }),
            }
        }
        .boxed();

        self.attempt = Some(Attempt { future, reply });
    }

    async fn attempt_finished(&mut self, result: Result<Link, TransportError>) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        match result {
            Ok(link) => self.on_connected(link, attempt.reply).await,
            Err(e) => {
                self.connection.attempt_failed();
                match attempt.reply {
                    Some(reply) => {
                        tracing::warn!("{e}");
                        let _ = reply.send(Err(e));
                    }
                    None => {
                        tracing::debug!(attempt = self.reconnector.attempts(), "Reconnection attempt failed: {e}");
                        self.schedule_reconnect();
                    }
                }
            }
        }
    }

    async fn on_connected(
        &mut self,
        link: Link,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) {
        let endpoint = self.connection.endpoint().unwrap_or_default().to_owned();
        self.connection.established(link);
        self.reconnector.reset();
        self.lost_notified = false;
        self.heartbeat.start(Instant::now());

        let handshake = Frame::handshake(&self.config.client_name, &self.config.capabilities);
        let flushed = match handshake.encode() {
            Ok(text) => match self.write_text(text).await {
                Ok(()) => self.drain_queue().await,
                Err(e) => Err(e),
            },
            Err(e) => {
                tracing::error!("Failed to encode handshake: {e}");
                self.drain_queue().await
            }
        };

        match flushed {
            Ok(count) => {
                tracing::info!(%endpoint, flushed = count, "Connected");
                self.publish(&ChannelEvent::Connected {
                    endpoint: endpoint.clone(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                let reason = e.to_string();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(TransportError::Connection {
                        endpoint,
                        reason: reason.clone(),
                    }));
                }
                self.handle_loss(reason);
            }
        }
    }

    async fn write_text(&mut self, text: String) -> Result<(), LinkError> {
        let Some(link) = self.connection.link_mut() else {
            return Err(LinkError::Closed);
        };
        link.sink.send(text).await
    }

    async fn drain_queue(&mut self) -> Result<usize, LinkError> {
        let mut flushed = 0;
        while let Some(entry) = self.queue.pop_front() {
            let text = match entry.frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(kind = %entry.frame.kind, "Dropping unencodable frame: {e}");
                    continue;
                }
            };
            if let Err(e) = self.write_text(text).await {
                self.queue.requeue_front(entry);
                return Err(e);
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    async fn write_or_queue(&mut self, frame: Frame) {
        if !self.connection.is_connected() {
            self.enqueue(frame);
            return;
        }
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = %frame.kind, "Dropping unencodable frame: {e}");
                return;
            }
        };
        if let Err(e) = self.write_text(text).await {
            // A request is failed by the loss below; only plain frames retry.
            if frame.id.is_none() {
                self.enqueue(frame);
            }
            self.handle_loss(e.to_string());
        }
    }

    fn enqueue(&mut self, frame: Frame) {
        let kind = frame.kind.clone();
        if let Err(e) = self.queue.push(frame, Instant::now()) {
            tracing::warn!(%kind, dropped = self.queue.dropped(), "{e}");
        }
    }

    /// Remove queued request frames whose request already settled, so a
    /// caller told "timed out" or "closed" never has the request run later.
    fn discard_settled_requests(&mut self) {
        let pending = &self.pending;
        let discarded = self.queue.retain(|entry| {
            entry.frame.id.as_ref().is_none_or(|id| pending.contains(id))
        });
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded queued frames of settled requests");
        }
    }

    fn handle_incoming(&mut self, incoming: Option<Result<String, LinkError>>) {
        match incoming {
            Some(Ok(text)) => self.handle_text(&text),
            Some(Err(e)) => self.handle_loss(e.to_string()),
            None => self.handle_loss("link closed by peer".to_owned()),
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Ignoring inbound frame: {e}");
                return;
            }
        };

        if self.pending.settle(&frame) {
            return;
        }
        if frame.kind == kinds::HEARTBEAT {
            self.heartbeat.record_ack(Instant::now());
        }

        match InboundEvent::from_frame(frame) {
            Ok(event) => self.publish(&ChannelEvent::Inbound(event)),
            Err(e) => tracing::warn!("Ignoring inbound frame: {e}"),
        }
    }

    /// Unintentional close: keep the queue, fail pending requests and
    /// schedule a reconnection.
    fn handle_loss(&mut self, reason: String) {
        if self.connection.lost().is_none() {
            return;
        }
        self.heartbeat.stop();
        let failed = self.pending.fail_all(&RequestError::ConnectionClosed);
        self.discard_settled_requests();
        let endpoint = self.connection.endpoint().unwrap_or_default().to_owned();
        tracing::warn!(%endpoint, %reason, failed_requests = failed, "Connection lost");

        if !self.lost_notified {
            self.lost_notified = true;
            self.publish(&ChannelEvent::ConnectionLost { endpoint, reason });
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnector.schedule(Instant::now()) {
            RetryDecision::Retry { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
                self.publish(&ChannelEvent::Reconnecting { attempt, delay });
            }
            RetryDecision::Exhausted { attempts } => {
                self.connection.give_up();
                tracing::error!(attempts, "Reconnection failed; giving up");
                self.publish(&ChannelEvent::ReconnectionFailed { attempts });
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(reply) = self.attempt.take().and_then(|attempt| attempt.reply) {
            let _ = reply.send(Err(TransportError::Connection {
                endpoint: self.connection.endpoint().unwrap_or_default().to_owned(),
                reason: "disconnected before the link opened".to_owned(),
            }));
        }
        if let Some(mut link) = self.connection.close() {
            let _ = link.sink.close().await;
        }
        self.heartbeat.stop();
        self.reconnector.reset();
        self.lost_notified = false;

        let failed = self.pending.fail_all(&RequestError::ConnectionClosed);
        let cleared = self.queue.clear();
        tracing::info!(failed_requests = failed, cleared_frames = cleared, "Disconnected");
        self.publish(&ChannelEvent::Disconnected);
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        if self.pending.expire(now) > 0 {
            self.discard_settled_requests();
        }

        match self.heartbeat.poll(now) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::Beat => match Frame::heartbeat().encode() {
                Ok(text) => {
                    if let Err(e) = self.write_text(text).await {
                        self.handle_loss(e.to_string());
                    }
                }
                Err(e) => tracing::error!("Failed to encode heartbeat: {e}"),
            },
            HeartbeatAction::TimedOut => {
                self.handle_loss("heartbeat not acknowledged".to_owned());
            }
        }

        if self.attempt.is_none() && self.reconnector.is_due(now) {
            let attempt = self.reconnector.begin_attempt();
            if let Some(endpoint) = self.connection.endpoint().map(str::to_owned) {
                tracing::debug!(%endpoint, attempt, "Reconnection attempt");
                self.start_attempt(endpoint, None);
            }
        }
    }

    fn publish(&self, event: &ChannelEvent) {
        let handlers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers_for(&event.kind());
        events::dispatch(&handlers, event);
    }

    fn publish_status(&self) {
        let next = ConnectionStatus {
            is_connected: self.connection.is_connected(),
            state: self.connection.state(),
            reconnect_attempts: self.reconnector.attempts(),
            queued_message_count: self.queue.len(),
            pending_request_count: self.pending.len(),
            dropped_message_count: self.queue.dropped(),
            endpoint: self.connection.endpoint().map(str::to_owned),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_attempt(attempt: &mut Option<Attempt>) -> Result<Link, TransportError> {
    match attempt {
        Some(attempt) => (&mut attempt.future).await,
        None => future::pending().await,
    }
}

async fn next_incoming(connection: &mut Connection) -> Option<Result<String, LinkError>> {
    match connection.link_mut() {
        Some(link) => link.stream.next().await,
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tavern_core::AgentId;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        config::{HeartbeatConfig, ReconnectConfig},
        connection::ConnectionState,
        link::{AcceptMode, MemoryConnector, MemoryListener, MemoryPeer},
        protocol::AgentThinking,
    };

    const ENDPOINT: &str = "memory://tavern";

    /// Heartbeats far enough apart that they never fire during a test.
    fn quiet_config() -> TransportConfig {
        TransportConfig::default().with_heartbeat(HeartbeatConfig::every(Duration::from_secs(86_400)))
    }

    fn events_of(channel: &Channel, kind: EventKind) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(kind, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
        rx
    }

    async fn accept_with_handshake(listener: &mut MemoryListener) -> MemoryPeer {
        let mut peer = listener.accept().await.unwrap();
        let handshake = peer.recv_frame().await.unwrap();
        assert_eq!(handshake.kind, kinds::HANDSHAKE);
        peer
    }

    async fn connected(config: TransportConfig) -> (Channel, MemoryConnector, MemoryListener, MemoryPeer) {
        let (connector, mut listener) = MemoryConnector::new();
        let channel = Channel::spawn(config, connector.clone());
        channel.connect(ENDPOINT).await.unwrap();
        let peer = accept_with_handshake(&mut listener).await;
        (channel, connector, listener, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_queued_while_disconnected_flush_in_order() {
        let (connector, mut listener) = MemoryConnector::new();
        let channel = Channel::spawn(quiet_config(), connector);

        for n in 1..=3 {
            channel.emit("order", json!({ "n": n })).unwrap();
        }
        channel.connect(ENDPOINT).await.unwrap();

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv_frame().await.unwrap().kind, kinds::HANDSHAKE);
        for n in 1..=3 {
            let frame = peer.recv_frame().await.unwrap();
            assert_eq!(frame.kind, "order");
            assert_eq!(frame.payload["n"], n);
        }

        let status = channel.status();
        assert!(status.is_connected);
        assert_eq!(status.queued_message_count, 0);
        assert_eq!(status.endpoint.as_deref(), Some(ENDPOINT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_resolves_with_matching_response() {
        let (channel, _connector, _listener, mut peer) = connected(quiet_config()).await;
        let mut custom = events_of(&channel, EventKind::Custom("get-state".into()));

        let response = channel.request("get-state", json!({}));
        let request = peer.recv_frame_of("get-state").await.unwrap();
        let id = request.id.clone().unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        peer.send_frame(&Frame::request("get-state", id, json!({ "mood": "merry" })));
        assert_eq!(response.await, Ok(json!({ "mood": "merry" })));
        assert_eq!(channel.status().pending_request_count, 0);
        assert!(custom.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_rejects_request() {
        let (channel, _connector, _listener, mut peer) = connected(quiet_config()).await;

        let response = channel.request("get-state", json!({}));
        let id = peer.recv_frame_of("get-state").await.unwrap().id.unwrap();
        peer.send_frame(&Frame::request("get-state", id, Value::Null).with_error("cellar flooded"));

        assert_eq!(response.await, Err(RequestError::Remote("cellar flooded".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_at_deadline() {
        let (channel, _connector, _listener, _peer) = connected(quiet_config()).await;

        let started = Instant::now();
        let result = channel
            .request_with_timeout("get-state", json!({}), Duration::from_millis(1_000))
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(RequestError::Timeout { ref kind, timeout_ms: 1_000, .. }) if kind == "get-state"
        ));
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_100));
        assert_eq!(channel.status().pending_request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_offline_request_is_never_sent() {
        let (connector, mut listener) = MemoryConnector::new();
        let channel = Channel::spawn(quiet_config(), connector);
        let mut custom = events_of(&channel, EventKind::Custom("get-state".into()));

        channel.emit("order", json!({ "n": 1 })).unwrap();
        let result = channel
            .request_with_timeout("get-state", json!({}), Duration::from_millis(1_000))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
        assert_eq!(channel.status().queued_message_count, 1);

        channel.connect(ENDPOINT).await.unwrap();
        let mut peer = accept_with_handshake(&mut listener).await;
        assert_eq!(peer.recv_frame().await.unwrap().kind, "order");

        channel.emit("marker", json!({})).unwrap();
        let next = peer.recv_frame().await.unwrap();
        assert_eq!(next.kind, "marker", "stale request leaked: {next:?}");
        assert!(custom.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_fails_pending_requests() {
        let (channel, _connector, _listener, mut peer) = connected(quiet_config()).await;
        let mut lost = events_of(&channel, EventKind::ConnectionLost);
        let mut reconnecting = events_of(&channel, EventKind::Reconnecting);

        let first = channel.request("get-state", json!({}));
        let second = channel.request("get-inventory", json!({}));
        peer.recv_frame_of("get-state").await.unwrap();
        peer.recv_frame_of("get-inventory").await.unwrap();
        drop(peer);

        assert_eq!(first.await, Err(RequestError::ConnectionClosed));
        assert_eq!(second.await, Err(RequestError::ConnectionClosed));

        assert!(matches!(
            lost.recv().await.unwrap(),
            ChannelEvent::ConnectionLost { endpoint, .. } if endpoint == ENDPOINT
        ));
        assert_eq!(
            reconnecting.recv().await.unwrap(),
            ChannelEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
        assert_eq!(channel.status().pending_request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_backs_off_then_gives_up() {
        let (channel, connector, _listener, peer) = connected(quiet_config()).await;
        let mut lost = events_of(&channel, EventKind::ConnectionLost);
        let mut reconnecting = events_of(&channel, EventKind::Reconnecting);
        let mut failed = events_of(&channel, EventKind::ReconnectionFailed);

        connector.set_mode(AcceptMode::Refuse);
        drop(peer);

        assert_eq!(
            failed.recv().await.unwrap(),
            ChannelEvent::ReconnectionFailed { attempts: 5 }
        );

        let mut delays = Vec::new();
        while let Ok(ChannelEvent::Reconnecting { delay, .. }) = reconnecting.try_recv() {
            delays.push(delay.as_secs());
        }
        assert_eq!(delays, [1, 2, 4, 8, 16]);

        assert!(lost.try_recv().is_ok());
        assert!(lost.try_recv().is_err(), "loss is reported once per outage");
        assert_eq!(connector.attempts(), 6);
        assert_eq!(channel.status().state, ConnectionState::Errored);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_link_and_flushes_queue() {
        let (channel, _connector, mut listener, peer) = connected(quiet_config()).await;
        let mut connected_events = events_of(&channel, EventKind::Connected);

        drop(peer);
        channel.emit("order", json!({ "dish": "stew" })).unwrap();

        let mut peer = accept_with_handshake(&mut listener).await;
        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame.kind, "order");
        assert_eq!(frame.payload["dish"], "stew");

        assert!(matches!(
            connected_events.recv().await.unwrap(),
            ChannelEvent::Connected { .. }
        ));
        assert!(channel.is_connected());
        assert_eq!(channel.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_trips_heartbeat_timeout() {
        let config = TransportConfig::default()
            .with_heartbeat(HeartbeatConfig::every(Duration::from_secs(30)))
            .with_reconnect(ReconnectConfig {
                max_attempts: 0,
                ..ReconnectConfig::default()
            });
        let (channel, _connector, _listener, mut peer) = connected(config).await;
        let mut lost = events_of(&channel, EventKind::ConnectionLost);

        let started = Instant::now();
        assert!(peer.recv_frame_of(kinds::HEARTBEAT).await.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let ChannelEvent::ConnectionLost { reason, .. } = lost.recv().await.unwrap() else {
            panic!("expected a connection loss");
        };
        assert!(reason.contains("heartbeat"));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_heartbeats_keep_link_alive() {
        let config = TransportConfig::default()
            .with_heartbeat(HeartbeatConfig::every(Duration::from_secs(30)));
        let (channel, _connector, _listener, mut peer) = connected(config).await;
        let mut lost = events_of(&channel, EventKind::ConnectionLost);

        let echo = tokio::spawn(async move {
            let mut beats = 0;
            while let Some(frame) = peer.recv_frame().await {
                if frame.kind == kinds::HEARTBEAT {
                    beats += 1;
                    peer.send_frame(&Frame::heartbeat());
                    if beats == 6 {
                        break;
                    }
                }
            }
            (peer, beats)
        });

        let (_peer, beats) = echo.await.unwrap();
        assert_eq!(beats, 6);
        assert!(channel.is_connected());
        assert!(lost.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_state_and_stays_down() {
        let (channel, connector, _listener, mut peer) = connected(quiet_config()).await;
        let mut disconnected = events_of(&channel, EventKind::Disconnected);

        let response = channel.request("get-state", json!({}));
        peer.recv_frame_of("get-state").await.unwrap();

        channel.disconnect().await.unwrap();
        assert_eq!(response.await, Err(RequestError::ConnectionClosed));
        assert_eq!(disconnected.recv().await.unwrap(), ChannelEvent::Disconnected);
        assert!(peer.recv_frame().await.is_none());

        let status = channel.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.pending_request_count, 0);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 1);

        channel.emit("order", json!({})).unwrap();
        channel.disconnect().await.unwrap();
        assert_eq!(channel.status().queued_message_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_newest_frames() {
        let (connector, mut listener) = MemoryConnector::new();
        let channel = Channel::spawn(quiet_config().with_queue_capacity(2), connector);

        for kind in ["first", "second", "third"] {
            channel.emit(kind, json!({})).unwrap();
        }
        channel.connect(ENDPOINT).await.unwrap();
        let mut peer = accept_with_handshake(&mut listener).await;

        assert_eq!(peer.recv_frame().await.unwrap().kind, "first");
        assert_eq!(peer.recv_frame().await.unwrap().kind, "second");
        assert!(peer.try_recv_frame().is_none());
        assert_eq!(channel.status().dropped_message_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_events_reach_subscribers_despite_failing_handlers() {
        let (channel, _connector, _listener, peer) = connected(quiet_config()).await;
        channel.subscribe(EventKind::AgentThinking, |_| anyhow::bail!("renderer offline"));
        channel.subscribe(EventKind::AgentThinking, |_| panic!("bubble exploded"));
        let mut thinking = events_of(&channel, EventKind::AgentThinking);

        peer.send_text("not json");
        peer.send_frame(&Frame::new(
            kinds::AGENT_THINKING,
            json!({ "agentId": "bard", "thought": "a rhyme for ale" }),
        ));

        let event = thinking.recv().await.unwrap();
        assert_eq!(
            event.as_inbound(),
            Some(&InboundEvent::AgentThinking(AgentThinking {
                agent_id: AgentId::from("bard"),
                thought: Some("a rhyme for ale".into()),
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_handler_is_not_called() {
        let (channel, _connector, _listener, peer) = connected(quiet_config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let id = channel.subscribe(EventKind::Custom("toast".into()), move |_| {
            tx.send(())?;
            Ok(())
        });
        let mut toasts = events_of(&channel, EventKind::Custom("toast".into()));

        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
        peer.send_frame(&Frame::new("toast", json!({})));

        toasts.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_retrying() {
        let (connector, _listener) = MemoryConnector::new();
        connector.set_mode(AcceptMode::Hang);
        let channel = Channel::spawn(quiet_config(), connector.clone());

        let started = Instant::now();
        let err = channel.connect(ENDPOINT).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection { ref endpoint, .. } if endpoint == ENDPOINT));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(channel.status().state, ConnectionState::Errored);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_while_connecting_is_rejected() {
        let (connector, _listener) = MemoryConnector::new();
        connector.set_mode(AcceptMode::Hang);
        let channel = Channel::spawn(quiet_config(), connector);

        let (first, second) = tokio::join!(channel.connect(ENDPOINT), channel.connect(ENDPOINT));
        assert!(matches!(first, Err(TransportError::Connection { .. })));
        assert_eq!(second, Err(TransportError::AlreadyConnecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_same_endpoint_is_a_no_op() {
        let (channel, connector, _listener, _peer) = connected(quiet_config()).await;
        channel.connect(ENDPOINT).await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_driver() {
        let (channel, _connector, _listener, _peer) = connected(quiet_config()).await;
        channel.shutdown().await;

        assert_eq!(channel.emit("order", json!({})), Err(TransportError::DriverStopped));
        assert_eq!(
            channel.request("get-state", json!({})).await,
            Err(RequestError::ConnectionClosed)
        );
        assert_eq!(channel.connect(ENDPOINT).await, Err(TransportError::DriverStopped));
    }
}
