//! Channel over a real WebSocket served by axum.

use std::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tavern_transport::{
    Channel, ChannelEvent, EventKind, Frame, InboundEvent, RequestError, TransportConfig,
    TransportError, WebSocketConnector, protocol::kinds,
};
use tokio::sync::mpsc;

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

/// Answers `get-state` requests, ignores `ignored` requests, echoes
/// heartbeats and greets the client with an `agent-thinking` event once the
/// handshake arrives.
async fn handle_socket(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = Frame::decode(text.as_str()) else {
            continue;
        };

        let reply = match frame.kind.as_str() {
            kinds::HANDSHAKE => Some(Frame::new(
                kinds::AGENT_THINKING,
                json!({ "agentId": "innkeeper", "thought": "a new guest" }),
            )),
            kinds::HEARTBEAT => Some(Frame::heartbeat()),
            "get-state" => frame
                .id
                .clone()
                .map(|id| Frame::request("get-state", id, json!({ "guests": 3 }))),
            _ => None,
        };

        if let Some(reply) = reply {
            let Ok(json) = reply.encode() else { continue };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    }
}

async fn serve() -> SocketAddr {
    let app = Router::new().route("/ws", get(ws_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let addr = serve().await;
    let channel = Channel::spawn(TransportConfig::default(), WebSocketConnector::new());

    let (tx, mut thinking) = mpsc::unbounded_channel();
    channel.subscribe(EventKind::AgentThinking, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });

    channel.connect(format!("ws://{addr}/ws")).await.unwrap();
    assert!(channel.is_connected());

    let greeting = tokio::time::timeout(Duration::from_secs(5), thinking.recv())
        .await
        .unwrap()
        .unwrap();
    let Some(InboundEvent::AgentThinking(event)) = greeting.as_inbound() else {
        panic!("expected agent-thinking, got {greeting:?}");
    };
    assert_eq!(event.agent_id.as_str(), "innkeeper");

    let state = channel.request("get-state", json!({})).await.unwrap();
    assert_eq!(state, json!({ "guests": 3 }));

    let ignored = channel
        .request_with_timeout("ignored", json!({}), Duration::from_millis(200))
        .await;
    assert!(matches!(ignored, Err(RequestError::Timeout { .. })));

    let (tx, mut disconnected) = mpsc::unbounded_channel();
    channel.subscribe(EventKind::Disconnected, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    channel.disconnect().await.unwrap();
    assert_eq!(disconnected.recv().await, Some(ChannelEvent::Disconnected));
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_unreachable_server_fails_connect() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel = Channel::spawn(TransportConfig::default(), WebSocketConnector::new());
    let err = channel.connect(format!("ws://{addr}/ws")).await.unwrap_err();
    assert!(matches!(err, TransportError::Connection { .. }));
}
