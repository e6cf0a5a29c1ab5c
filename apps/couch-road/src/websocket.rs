use crate::relay::{ConnectionId, Relay};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use couch_core::channel::wire::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

/// Periodically drops connections whose heartbeat stopped.
pub fn spawn_sweeper(relay: Arc<Relay>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = relay.sweep_stale(timeout);
            if removed > 0 {
                debug!(target: "couch::road", removed, "stale sweep finished");
            }
        }
    })
}

async fn health_check() -> &'static str {
    "ok"
}

async fn websocket_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (id, mut outbound) = relay.register();
    let (mut sender, mut receiver) = socket.split();
    debug!(target: "couch::road", connection = id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(target: "couch::road", connection = id, error = %err, "failed to encode server message");
                }
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(target: "couch::road", connection = id, error = %err, "websocket error");
                break;
            }
        };
        dispatch(&relay, id, &text);
    }

    relay.disconnect(id);
    writer.abort();
    debug!(target: "couch::road", connection = id, "websocket closed");
}

fn dispatch(relay: &Relay, id: ConnectionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => relay.handle(id, message),
        Err(err) => {
            warn!(target: "couch::road", connection = id, error = %err, "invalid client message");
            relay.reply(
                id,
                ServerMessage::Error {
                    message: format!("Invalid message format: {err}"),
                },
            );
        }
    }
}
