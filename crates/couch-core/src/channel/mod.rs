//! Shared-channel transport: join handshake, request correlation, presence.

pub mod connector;
pub mod memory;
pub mod pending;
pub mod session;
pub mod transport;
pub mod websocket;
pub mod wire;

pub use connector::{
    Connection, ConnectionHandle, Connector, DisconnectKind, DisconnectReason, Inbound,
};
pub use memory::MemoryHub;
pub use session::{ChannelSession, PresenceChange, PresenceKind, merge_status};
pub use transport::{ChannelEvent, ChannelTransport, IncomingRequest, RequestPayload};
pub use websocket::WebSocketConnector;
pub use wire::{
    Address, ChannelProfile, Frame, ParticipantRole, PresenceType, RequestId, ResponseBody,
    StatusMap,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Channel name plus secret; concatenated they form the join code.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub name: String,
    pub secret: String,
}

impl ChannelIdentity {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }

    pub fn join_code(&self) -> String {
        format!("{}{}", self.name, self.secret)
    }
}

impl fmt::Debug for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIdentity")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    pub nickname: String,
    pub role: ParticipantRole,
    /// Retry an unauthorized join once without a secret. Covers a channel
    /// that does not exist yet and so carries no lock.
    pub retry_on_unauthorized: bool,
}

impl JoinOptions {
    pub fn controller() -> Self {
        Self {
            nickname: "tv".to_string(),
            role: ParticipantRole::Controller,
            retry_on_unauthorized: false,
        }
    }

    pub fn remote() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            nickname: format!("remote-{}", &suffix[..8]),
            role: ParticipantRole::Remote,
            retry_on_unauthorized: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("another participant holds this identity")]
    JoinConflict,
    #[error("channel secret rejected")]
    Unauthorized,
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("join handshake timed out")]
    JoinTimeout,
    #[error("already joined to a channel")]
    AlreadyJoined,
    #[error("not joined to a channel")]
    NotJoined,
    #[error("request timed out")]
    RequestTimeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("channel disconnected")]
    Disconnected,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("connection closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}
