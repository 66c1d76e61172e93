//! WebSocket adapter against an in-process axum server.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fanout_transport::{
    Identity, PublishError, Transport, TransportEvent, WebSocketConfig, WebSocketTransport,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/ws", get(upgrade))
        .route("/closing", get(upgrade_and_close));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{}", addr)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let uuid = params.get("uuid").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve(socket, uuid))
}

async fn upgrade_and_close(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn send_json(socket: &mut WebSocket, value: Value) {
    let _ = socket.send(Message::Text(value.to_string())).await;
}

/// A tiny broker: greets every subscribe with a flat event, echoes publishes
/// to subscribed channels and acknowledges publishes that carry an id.
async fn serve(mut socket: WebSocket, uuid: String) {
    let mut subscribed = HashSet::new();

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let channel = frame["channel"].as_str().unwrap_or_default().to_string();

        match frame["action"].as_str() {
            Some("subscribe") => {
                subscribed.insert(channel.clone());
                send_json(&mut socket, json!({"channel": channel, "greeting": "welcome"})).await;
            }
            Some("unsubscribe") => {
                subscribed.remove(&channel);
            }
            Some("publish") => {
                let id = frame.get("id").cloned();
                if channel == "forbidden" {
                    send_json(&mut socket, json!({"error": "forbidden", "id": id})).await;
                    continue;
                }
                if let Some(id) = id {
                    send_json(&mut socket, json!({ "ack": id })).await;
                }
                if subscribed.contains(&channel) {
                    send_json(
                        &mut socket,
                        json!({
                            "channel": channel,
                            "message": frame["message"],
                            "publisher": uuid,
                            "timetoken": "1"
                        }),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }
}

fn collect(transport: &WebSocketTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport
        .on_event(Arc::new(move |event| {
            let _ = tx.send(event);
        }))
        .unwrap();
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_subscribe_and_echo() {
    let base = spawn_server().await;
    let transport = WebSocketTransport::new(WebSocketConfig::new(format!("{}/ws", base)));
    let mut events = collect(&transport);

    transport.connect(&Identity::new("user-1")).await.unwrap();
    assert!(transport.is_connected());

    transport.send_subscribe("room.1").unwrap();
    match next_event(&mut events).await {
        TransportEvent::Message(event) => {
            assert_eq!(event.topic, "room.1");
            assert_eq!(event.payload, json!({"greeting": "welcome"}));
            assert!(event.publisher.is_none());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    transport.publish("room.1", json!({"text": "hi"})).await.unwrap();
    match next_event(&mut events).await {
        TransportEvent::Message(event) => {
            assert_eq!(event.topic, "room.1");
            assert_eq!(event.payload, json!({"text": "hi"}));
            assert_eq!(event.publisher.as_deref(), Some("user-1"));
            assert_eq!(event.timetoken.as_deref(), Some("1"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let base = spawn_server().await;
    let transport = WebSocketTransport::new(WebSocketConfig::new(format!("{}/ws", base)));

    let first = transport.connect(&Identity::new("user-1")).await.unwrap();
    let second = transport.connect(&Identity::new("user-1")).await.unwrap();
    assert_eq!(first.connected_at(), second.connected_at());
}

#[tokio::test]
async fn test_publish_acknowledgment() {
    let base = spawn_server().await;
    let config = WebSocketConfig {
        publish_ack_timeout: Some(Duration::from_secs(5)),
        ..WebSocketConfig::new(format!("{}/ws", base))
    };
    let transport = WebSocketTransport::new(config);
    transport.connect(&Identity::new("user-1")).await.unwrap();

    transport.publish("room.1", json!(1)).await.unwrap();

    let rejected = transport.publish("forbidden", json!(1)).await;
    assert!(matches!(rejected, Err(PublishError::Rejected(reason)) if reason == "forbidden"));
}

#[tokio::test]
async fn test_server_close_is_reported() {
    let base = spawn_server().await;
    let transport = WebSocketTransport::new(WebSocketConfig::new(format!("{}/closing", base)));
    let mut events = collect(&transport);

    transport.connect(&Identity::new("user-1")).await.unwrap();

    loop {
        if let TransportEvent::Closed = next_event(&mut events).await {
            break;
        }
    }
    assert!(!transport.is_connected());
    assert!(matches!(
        transport.publish("room.1", json!(1)).await,
        Err(PublishError::NotConnected)
    ));
}
