use super::ChannelError;
use super::connector::{Connection, ConnectionHandle, Connector, DisconnectReason, Inbound};
use super::wire::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connects to a `couch-road` relay over a websocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Accepts `http(s)://` or `ws(s)://` relay URLs; a bare host gets the
    /// `/ws` path.
    pub fn new(relay_url: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            url: derive_websocket_url(relay_url)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ChannelError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "couch::websocket", url = %self.url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Inbound>();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "couch::websocket", error = %err, "failed to encode client message");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_closed = Arc::clone(&closed);
        let reader_handle = tokio::spawn(async move {
            let mut reason = DisconnectReason::network("relay closed the connection");
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "couch::websocket", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "couch::websocket", "relay websocket error: {err}");
                            }
                        }
                        reason = DisconnectReason::network(err.to_string());
                        break;
                    }
                };
                tracing::trace!(target: "couch::websocket", event = "ws_in", len = text.len());
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if inbound_tx.send(Inbound::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target: "couch::websocket", error = %err, "dropping undecodable relay message");
                    }
                }
            }
            if !reader_closed.load(Ordering::SeqCst) {
                let _ = inbound_tx.send(Inbound::Closed(reason));
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let handle = WebSocketHandle {
            send_tx,
            closed,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        };
        Ok(Connection {
            handle: Arc::new(handle),
            inbound,
        })
    }
}

struct WebSocketHandle {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHandle for WebSocketHandle {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }
        self.send_tx
            .send(message)
            .map_err(|_| ChannelError::ChannelClosed)
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_background();
    }
}

impl WebSocketHandle {
    /// Stops the reader and heartbeat. The writer is left to drain queued
    /// messages (a trailing `Leave`) and exits once `send_tx` is dropped.
    fn abort_background(&self) {
        for handle in self.tasks.lock().iter().skip(1) {
            handle.abort();
        }
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.abort_background();
    }
}

fn derive_websocket_url(relay_url: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| ChannelError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Setup("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}
