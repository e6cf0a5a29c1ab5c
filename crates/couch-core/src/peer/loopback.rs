//! In-process peer links. Offers and answers carry an endpoint id instead of
//! SDP; everything else follows the same event sequence as a real link.

use super::{PeerConnection, PeerConnectionEvent, PeerConnectionParts, PeerConnector, PeerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    fail_links: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<u64, Endpoint>,
    next_id: u64,
    created: usize,
}

struct Endpoint {
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    partner: Option<u64>,
    open: bool,
}

impl NetworkState {
    fn notify(&self, id: u64, event: PeerConnectionEvent) {
        if let Some(endpoint) = self.endpoints.get(&id) {
            let _ = endpoint.events.send(event);
        }
    }

    fn unlink(&mut self, id: u64) -> Option<u64> {
        let endpoint = self.endpoints.get_mut(&id)?;
        endpoint.open = false;
        let partner = endpoint.partner.take()?;
        if let Some(other) = self.endpoints.get_mut(&partner) {
            other.open = false;
            other.partner = None;
        }
        Some(partner)
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every answer fails ICE instead of opening the link.
    pub fn set_links_fail(&self, fail: bool) {
        self.fail_links.store(fail, Ordering::SeqCst);
    }

    pub fn connections_created(&self) -> usize {
        self.state.lock().created
    }

    pub fn open_links(&self) -> usize {
        self.state
            .lock()
            .endpoints
            .values()
            .filter(|endpoint| endpoint.open)
            .count()
            / 2
    }

    /// Breaks every open link; both ends see the data channel close.
    pub fn sever_all(&self) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .endpoints
            .iter()
            .filter(|(_, endpoint)| endpoint.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            if let Some(partner) = state.unlink(id) {
                state.notify(id, PeerConnectionEvent::DataChannelClosed);
                state.notify(partner, PeerConnectionEvent::DataChannelClosed);
            }
        }
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn create_connection(
        &self,
        _ice_servers: &[String],
    ) -> Result<PeerConnectionParts, PeerError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.created += 1;
            let id = state.next_id;
            state.endpoints.insert(
                id,
                Endpoint {
                    events,
                    partner: None,
                    open: false,
                },
            );
            id
        };
        let connection = LoopbackConnection {
            network: self.clone(),
            id,
        };
        Ok((Arc::new(connection), events_rx))
    }
}

struct LoopbackConnection {
    network: LoopbackNetwork,
    id: u64,
}

fn endpoint_id(description: &Value) -> Result<u64, PeerError> {
    description
        .get("endpoint")
        .and_then(Value::as_u64)
        .ok_or_else(|| PeerError::NegotiationFailed("description carries no endpoint".into()))
}

impl LoopbackConnection {
    fn candidate(&self) -> Value {
        json!({"candidate": format!("candidate:loopback {}", self.id), "sdpMid": "0"})
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        let state = self.network.state.lock();
        state.notify(self.id, PeerConnectionEvent::IceCandidate(self.candidate()));
        Ok(json!({"type": "offer", "endpoint": self.id}))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, PeerError> {
        let offerer = endpoint_id(&offer)?;
        let mut state = self.network.state.lock();
        if !state.endpoints.contains_key(&offerer) {
            return Err(PeerError::NegotiationFailed("offerer is gone".into()));
        }
        if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
            endpoint.partner = Some(offerer);
        }
        if let Some(endpoint) = state.endpoints.get_mut(&offerer) {
            endpoint.partner = Some(self.id);
        }
        state.notify(self.id, PeerConnectionEvent::IceCandidate(self.candidate()));
        Ok(json!({"type": "answer", "endpoint": self.id}))
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), PeerError> {
        let answerer = endpoint_id(&answer)?;
        let mut state = self.network.state.lock();
        let linked = state
            .endpoints
            .get(&self.id)
            .is_some_and(|endpoint| endpoint.partner == Some(answerer));
        if !linked {
            return Err(PeerError::NegotiationFailed("answer from unknown endpoint".into()));
        }
        if self.network.fail_links.load(Ordering::SeqCst) {
            state.unlink(self.id);
            state.notify(self.id, PeerConnectionEvent::Failed("ice failed".into()));
            state.notify(answerer, PeerConnectionEvent::Failed("ice failed".into()));
            return Ok(());
        }
        for id in [self.id, answerer] {
            if let Some(endpoint) = state.endpoints.get_mut(&id) {
                endpoint.open = true;
            }
            state.notify(id, PeerConnectionEvent::DataChannelOpen);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        if candidate.get("candidate").is_none() {
            return Err(PeerError::NegotiationFailed("malformed candidate".into()));
        }
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        let state = self.network.state.lock();
        let partner = state
            .endpoints
            .get(&self.id)
            .filter(|endpoint| endpoint.open)
            .and_then(|endpoint| endpoint.partner)
            .ok_or(PeerError::NotConnected)?;
        state.notify(partner, PeerConnectionEvent::Message(text));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.state.lock();
        if let Some(partner) = state.unlink(self.id) {
            state.notify(partner, PeerConnectionEvent::DataChannelClosed);
        }
        state.endpoints.remove(&self.id);
    }
}
