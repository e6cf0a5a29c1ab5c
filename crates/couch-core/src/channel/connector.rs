//! The transport primitive a [`ChannelTransport`](super::ChannelTransport)
//! is built on: connect, send a message, receive messages, disconnect.

use super::ChannelError;
use super::wire::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a fresh connection to the relay. The connection is not yet part
    /// of any channel; joining is done by sending [`ClientMessage::Join`].
    async fn connect(&self) -> Result<Connection, ChannelError>;
}

pub trait ConnectionHandle: Send + Sync {
    /// Queues a message. Messages sent through one handle are delivered in
    /// order.
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError>;

    /// Releases the connection without producing an [`Inbound::Closed`].
    fn disconnect(&self);
}

pub struct Connection {
    pub handle: Arc<dyn ConnectionHandle>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    /// The connection died underneath us. Never produced after
    /// [`ConnectionHandle::disconnect`].
    Closed(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Network,
    Kicked,
    Unauthorized,
    Conflict,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub kind: DisconnectKind,
    pub detail: String,
}

impl DisconnectReason {
    pub fn new(kind: DisconnectKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(DisconnectKind::Network, detail)
    }

    /// Unauthorized disconnects are terminal; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, DisconnectKind::Unauthorized)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}
