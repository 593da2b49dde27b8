//! Tavern simulation demo.
//!
//! Run with: cargo run -p tavern-sim
//!
//! Starts an in-process relay and a client that schedules conversations
//! against it. Set `TAVERN_ENDPOINT` to talk to another server instead,
//! and `RUST_LOG` to adjust logging.

mod relay;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use serde_json::json;
use tavern_core::{
    AgentId, ParticipantObserver, ParticipantState, PresentationHandle, RetireReason, Session,
    SessionId, SessionMetadata, SessionObserver,
};
use tavern_session::{SchedulerConfig, SessionScheduler};
use tavern_transport::{
    Channel, ChannelEvent, EventKind, TransportConfig, WebSocketConnector,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for a conversation bubble on screen.
struct Bubble {
    session_id: SessionId,
}

impl PresentationHandle for Bubble {
    fn close(&mut self, reason: RetireReason) {
        tracing::info!(session_id = %self.session_id, ?reason, "Bubble closed");
    }
}

/// Logs every lifecycle and participant change.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_session_active(&self, session: &Session) -> Option<Box<dyn PresentationHandle>> {
        let names: Vec<&str> = session.participants.iter().map(AgentId::as_str).collect();
        tracing::info!(session_id = %session.id, origin = ?session.origin, "Conversation: {}", names.join(" & "));
        Some(Box::new(Bubble {
            session_id: session.id,
        }))
    }

    fn on_session_queued(&self, session: &Session) {
        tracing::info!(session_id = %session.id, "Waiting for a free table");
    }

    fn on_session_retired(&self, session_id: SessionId, reason: RetireReason) {
        tracing::info!(%session_id, ?reason, "Conversation over");
    }
}

impl ParticipantObserver for LogObserver {
    fn on_participant_state_changed(&self, agent_id: &AgentId, state: &ParticipantState) {
        match &state.annotation {
            Some(text) => tracing::info!(agent = %agent_id, phase = %state.phase, "{text}"),
            None => tracing::debug!(agent = %agent_id, phase = %state.phase),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let endpoint = match std::env::var("TAVERN_ENDPOINT") {
        Ok(endpoint) => endpoint,
        Err(_) => {
            let addr = relay::spawn(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            format!("ws://{addr}/ws")
        }
    };

    let channel = Channel::spawn(
        TransportConfig::default().with_client_name("tavern-sim"),
        WebSocketConnector::new(),
    );
    for kind in [
        EventKind::Connected,
        EventKind::ConnectionLost,
        EventKind::Reconnecting,
        EventKind::ReconnectionFailed,
    ] {
        channel.subscribe(kind, |event: &ChannelEvent| {
            tracing::info!("Channel: {event:?}");
            Ok(())
        });
    }

    let observer = Arc::new(LogObserver);
    let scheduler = SessionScheduler::builder(channel.clone())
        .config(SchedulerConfig::default())
        .session_observer(observer.clone())
        .participant_observer(observer)
        .build();

    channel.connect(endpoint).await?;

    let state = channel.request("get-state", json!({})).await?;
    tracing::info!("Tavern state: {state}");

    let pairs = [
        ["innkeeper", "bard"],
        ["blacksmith", "ranger"],
        ["merchant", "innkeeper"],
        ["bard", "ranger"],
    ];
    for pair in pairs {
        let metadata = SessionMetadata::new().with("topic", "the evening's news");
        scheduler.request_session(pair, metadata)?;
    }

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(20)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    tracing::info!(
        status = ?channel.status(),
        active = scheduler.list_active().len(),
        queued = scheduler.list_queued().len(),
        "Closing up"
    );
    channel.shutdown().await;
    Ok(())
}
