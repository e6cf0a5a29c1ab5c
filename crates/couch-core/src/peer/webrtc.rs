use super::{PeerConnection, PeerConnectionEvent, PeerConnectionParts, PeerConnector, PeerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const DATA_CHANNEL_LABEL: &str = "couch";

/// Peer links over WebRTC data channels with trickle ICE.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerConnector;

#[async_trait]
impl PeerConnector for WebRtcPeerConnector {
    async fn create_connection(
        &self,
        ice_servers: &[String],
    ) -> Result<PeerConnectionParts, PeerError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation_error)?,
        );
        let (events, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(&init)) {
                    Ok(Ok(value)) => {
                        let _ = tx.send(PeerConnectionEvent::IceCandidate(value));
                    }
                    Ok(Err(err)) => {
                        warn!(target: "couch::webrtc", error = %err, "failed to encode local candidate");
                    }
                    Err(err) => {
                        warn!(target: "couch::webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                debug!(target: "couch::webrtc", state = ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = tx.send(PeerConnectionEvent::Failed(
                        "peer connection failed".into(),
                    ));
                }
            })
        }));

        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let answer_channel = channel.clone();
        let answer_tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = answer_channel.clone();
            let tx = answer_tx.clone();
            Box::pin(async move {
                info!(target: "couch::webrtc", label = %dc.label(), "remote data channel announced");
                wire_data_channel(&dc, tx);
                *channel.lock() = Some(dc);
            })
        }));

        let connection = WebRtcPeerConnection {
            pc,
            channel,
            events,
        };
        Ok((Arc::new(connection), events_rx))
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(negotiation_error)?;
        wire_data_channel(&dc, self.events.clone());
        *self.channel.lock() = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        serde_json::to_value(&offer).map_err(|err| PeerError::Encode(err.to_string()))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, PeerError> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)
            .map_err(|err| PeerError::NegotiationFailed(format!("malformed offer: {err}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation_error)?;
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        serde_json::to_value(&answer).map_err(|err| PeerError::Encode(err.to_string()))
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), PeerError> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)
            .map_err(|err| PeerError::NegotiationFailed(format!("malformed answer: {err}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|err| PeerError::NegotiationFailed(format!("malformed candidate: {err}")))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_error)
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        let dc = self.channel.lock().clone().ok_or(PeerError::NotConnected)?;
        dc.send_text(text)
            .await
            .map(|_| ())
            .map_err(|_| PeerError::NotConnected)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target: "couch::webrtc", error = %err, "error closing peer connection");
        }
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerConnectionEvent>) {
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerConnectionEvent::DataChannelOpen);
        })
    }));

    let close_tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerConnectionEvent::DataChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(target: "couch::webrtc", len = msg.data.len(), "ignoring binary data channel message");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(PeerConnectionEvent::Message(text));
                }
                Err(err) => {
                    warn!(target: "couch::webrtc", error = %err, "dropping non-utf8 data channel message");
                }
            }
        })
    }));
}

fn negotiation_error(err: webrtc::Error) -> PeerError {
    PeerError::NegotiationFailed(err.to_string())
}
