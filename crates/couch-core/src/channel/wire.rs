//! Wire shapes exchanged with a channel relay.
//!
//! Everything here is JSON. Frames between participants travel inside
//! [`ClientMessage::Frame`] / [`ServerMessage::Frame`]; the relay stamps the
//! sender address on the way through, so `from` on an inbound frame can be
//! trusted as much as the relay can.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque key-value status carried in presence.
pub type StatusMap = serde_json::Map<String, Value>;

/// A participant address: `<channel>/<nickname>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(channel: &str, nickname: &str) -> Self {
        Self(format!("{channel}/{nickname}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn channel(&self) -> &str {
        self.0.rsplit_once('/').map(|(channel, _)| channel).unwrap_or("")
    }

    pub fn nickname(&self) -> &str {
        self.0
            .rsplit_once('/')
            .map(|(_, nickname)| nickname)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Correlation id matching a response or ack to its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Controller,
    Remote,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Controller => "controller",
            ParticipantRole::Remote => "remote",
        }
    }
}

/// Participant-to-participant frames.
///
/// `data` on commands and messages is a JSON document serialized to a
/// string; receivers parse it themselves so a bad payload can be acked as a
/// no-op instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Command {
        from: Address,
        id: RequestId,
        command_type: String,
        data: String,
    },
    Message {
        from: Address,
        id: RequestId,
        message_type: String,
        data: String,
    },
    Response {
        from: Address,
        id: RequestId,
        body: ResponseBody,
    },
}

impl Frame {
    pub fn from(&self) -> &Address {
        match self {
            Frame::Command { from, .. }
            | Frame::Message { from, .. }
            | Frame::Response { from, .. } => from,
        }
    }

    pub fn id(&self) -> &RequestId {
        match self {
            Frame::Command { id, .. } | Frame::Message { id, .. } | Frame::Response { id, .. } => {
                id
            }
        }
    }

    /// Rewrites the sender; relays call this so participants cannot spoof.
    pub fn with_sender(mut self, sender: &Address) -> Self {
        match &mut self {
            Frame::Command { from, .. }
            | Frame::Message { from, .. }
            | Frame::Response { from, .. } => *from = sender.clone(),
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseBody {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error {
        reason: String,
    },
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Ok { data: Value::Null }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceType {
    Join,
    Unavailable,
    Error,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceFrame {
    pub from: Address,
    #[serde(rename = "type")]
    pub kind: PresenceType,
    #[serde(default)]
    pub state: StatusMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRejection {
    /// Another participant already holds the requested nickname.
    Conflict,
    /// The channel is locked with a different secret.
    Unauthorized,
    Other,
}

/// Public channel metadata handed back on a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub name: String,
    pub address: Address,
    pub participants: usize,
}

/// Messages a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        nickname: String,
        role: ParticipantRole,
    },
    Frame {
        to: Address,
        frame: Frame,
    },
    Presence {
        state: StatusMap,
    },
    UpdateSecret {
        secret: String,
    },
    Leave,
    Ping,
}

/// Messages the relay sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinAccepted {
        profile: ChannelProfile,
    },
    JoinRejected {
        reason: JoinRejection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Frame {
        frame: Frame,
    },
    Presence {
        presence: PresenceFrame,
    },
    Pong,
    Error {
        message: String,
    },
}
