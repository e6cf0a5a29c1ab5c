//! Direct peer links negotiated over the shared channel.
//!
//! Offers, answers and ICE candidates ride the shared channel as messages of
//! type [`PEER_SIGNAL_MESSAGE`]. Once a link's data channel opens, commands,
//! acks and status travel over it as [`PeerFrame`]s.

pub mod loopback;
pub mod reconnect;
pub mod signaling;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use loopback::LoopbackNetwork;
pub use reconnect::{LinkStarter, PeerReconnectSupervisor};
pub use signaling::PeerSignalingChannel;
#[cfg(feature = "webrtc")]
pub use self::webrtc::WebRtcPeerConnector;

use crate::channel::{Address, ChannelError, RequestId, StatusMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Shared-channel message type reserved for link negotiation.
pub const PEER_SIGNAL_MESSAGE: &str = "couch-peer-signal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayPayload {
    Offer { description: Value },
    Answer { description: Value },
    Candidate { candidate: Value },
}

/// Frames carried on an open data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerFrame {
    Command {
        id: RequestId,
        command_type: String,
        data: String,
    },
    Ack {
        id: RequestId,
    },
    Status {
        status: StatusMap,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Emitted on open, and on close or failure even for a link that never
    /// opened.
    DataChannelReady { address: Address, ready: bool },
    Command {
        from: Address,
        id: RequestId,
        command_type: String,
        data: String,
    },
    Status { from: Address, status: StatusMap },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerConnectionEvent {
    IceCandidate(Value),
    DataChannelOpen,
    DataChannelClosed,
    Message(String),
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("a link to this peer is already being negotiated")]
    AlreadyNegotiating,
    #[error("no open link to peer")]
    NotConnected,
    #[error("peer link lost")]
    LinkLost,
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("both sides offered at once")]
    CrossedOffer,
    #[error("peer link stopped")]
    Cancelled,
    #[error("failed to encode peer frame: {0}")]
    Encode(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type PeerConnectionParts = (
    Arc<dyn PeerConnection>,
    mpsc::UnboundedReceiver<PeerConnectionEvent>,
);

#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn create_connection(
        &self,
        ice_servers: &[String],
    ) -> Result<PeerConnectionParts, PeerError>;
}

/// One side of a direct link with a single ordered data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates the data channel and returns the local offer.
    async fn create_offer(&self) -> Result<Value, PeerError>;

    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value, PeerError>;

    async fn accept_answer(&self, answer: Value) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError>;

    async fn send_text(&self, text: String) -> Result<(), PeerError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_payload_is_tagged() {
        let payload = RelayPayload::Candidate {
            candidate: json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "candidate");
        let back: RelayPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn ack_frame_shape() {
        let frame: PeerFrame = serde_json::from_str(r#"{"type":"ack","id":"r-9"}"#).unwrap();
        assert_eq!(
            frame,
            PeerFrame::Ack {
                id: RequestId::from("r-9")
            }
        );
    }
}
