//! Minimal simulation server.
//!
//! Acknowledges heartbeats, answers `get-state` requests, plays a short
//! scripted exchange for every announced conversation and now and then
//! starts a conversation of its own.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tavern_transport::{
    Frame,
    protocol::{ConversationStart, kinds},
};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

const PATRONS: [&str; 5] = ["innkeeper", "bard", "blacksmith", "ranger", "merchant"];

const LINES: [&str; 4] = [
    "Another round for the table by the hearth!",
    "They say the old mill is haunted again.",
    "I'd trade my best blade for a quiet night.",
    "Sing us the one about the dragon, bard.",
];

/// Relay state shared across connections.
#[derive(Clone, Default)]
struct RelayState {
    connections: Arc<AtomicUsize>,
    conversations: Arc<AtomicUsize>,
}

/// Start the relay on `addr` (port 0 picks a free port).
pub async fn spawn(addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(RelayState::default());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!("Relay listening on ws://{local}/ws");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Relay stopped: {e}");
        }
    });
    Ok(local)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection = state.connections.fetch_add(1, Ordering::Relaxed) + 1;

    // Channel for sending frames to the WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match frame.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to encode frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let ambient_task = tokio::spawn(ambient_conversations(tx.clone(), connection));

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let frame = match Frame::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Relay ignored frame: {e}");
                continue;
            }
        };

        match frame.kind.as_str() {
            kinds::HANDSHAKE => {
                tracing::info!(payload = %frame.payload, "Client handshake");
            }
            kinds::HEARTBEAT => {
                let _ = tx.send(Frame::heartbeat());
            }
            kinds::CONVERSATION_START => {
                match serde_json::from_value::<ConversationStart>(frame.payload) {
                    Ok(start) => {
                        state.conversations.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(play_conversation(tx.clone(), start));
                    }
                    Err(e) => tracing::warn!("Bad conversation-start: {e}"),
                }
            }
            "get-state" => {
                if let Some(id) = frame.id {
                    let _ = tx.send(Frame::request(
                        "get-state",
                        id,
                        json!({
                            "patrons": PATRONS,
                            "connections": state.connections.load(Ordering::Relaxed),
                            "conversations": state.conversations.load(Ordering::Relaxed),
                        }),
                    ));
                }
            }
            other => {
                if let Some(id) = frame.id {
                    let _ = tx.send(
                        Frame::request(other, id, Value::Null)
                            .with_error(format!("unknown request type: {other}")),
                    );
                }
            }
        }
    }

    ambient_task.abort();
    send_task.abort();
    tracing::info!(connection, "Client left");
}

/// Scripted exchange: each participant thinks, then speaks, then the
/// conversation ends.
///
/// Listeners cannot go straight to thinking, so every participant after
/// the initiator is released to idle before taking a turn.
async fn play_conversation(tx: mpsc::UnboundedSender<Frame>, start: ConversationStart) {
    let Some(session_id) = start.session_id else {
        return;
    };

    for (turn, agent) in start.participants.iter().enumerate() {
        tokio::time::sleep(Duration::from_millis(400)).await;
        if turn > 0 {
            let released = Frame::new(
                kinds::AGENT_STATE_CHANGE,
                json!({ "agentId": agent, "state": "idle" }),
            );
            if tx.send(released).is_err() {
                return;
            }
        }
        let thinking = Frame::new(
            kinds::AGENT_THINKING,
            json!({ "agentId": agent, "thought": format!("{agent} considers a reply") }),
        );
        if tx.send(thinking).is_err() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        let response = Frame::new(
            kinds::AGENT_RESPONSE,
            json!({ "agentId": agent, "message": LINES[turn % LINES.len()] }),
        );
        if tx.send(response).is_err() {
            return;
        }
    }

    let _ = tx.send(Frame::new(
        kinds::CONVERSATION_UPDATE,
        json!({ "sessionId": session_id, "status": "completed" }),
    ));
}

/// Every few seconds, two patrons strike up a conversation on their own.
async fn ambient_conversations(tx: mpsc::UnboundedSender<Frame>, seed: usize) {
    let mut round = seed;
    loop {
        tokio::time::sleep(Duration::from_secs(6)).await;
        round += 1;
        let start = ConversationStart {
            session_id: Some(Uuid::new_v4()),
            participants: vec![
                PATRONS[round % PATRONS.len()].into(),
                PATRONS[(round + 2) % PATRONS.len()].into(),
            ],
            metadata: tavern_core::SessionMetadata::new().with("topic", "rumours"),
        };
        let Ok(payload) = serde_json::to_value(&start) else {
            continue;
        };
        if tx.send(Frame::new(kinds::CONVERSATION_START, payload)).is_err() {
            return;
        }
        tokio::spawn(play_conversation(tx.clone(), start));
    }
}
