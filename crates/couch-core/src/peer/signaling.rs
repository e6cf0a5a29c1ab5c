use super::{
    PEER_SIGNAL_MESSAGE, PeerConnection, PeerConnectionEvent, PeerConnector, PeerError, PeerEvent,
    PeerFrame, RelayPayload,
};
use crate::channel::pending::PendingRequests;
use crate::channel::{Address, ChannelTransport, RequestId, RequestPayload, StatusMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Negotiating,
    Connected,
    Closed,
}

struct PeerLink {
    generation: u64,
    state: LinkState,
    connection: Option<Arc<dyn PeerConnection>>,
    pump: Option<JoinHandle<()>>,
    acks: Arc<PendingRequests<(), PeerError>>,
}

impl PeerLink {
    fn negotiating(generation: u64) -> Self {
        Self {
            generation,
            state: LinkState::Negotiating,
            connection: None,
            pump: None,
            acks: Arc::new(PendingRequests::new()),
        }
    }

    fn shut(mut self, error: PeerError) {
        self.state = LinkState::Closed;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.acks.reject_all(|| error.clone());
        if let Some(connection) = self.connection.take() {
            tokio::spawn(async move { connection.close().await });
        }
    }
}

struct SignalingInner {
    transport: ChannelTransport,
    connector: Arc<dyn PeerConnector>,
    ice_servers: Vec<String>,
    links: Mutex<HashMap<Address, PeerLink>>,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// Negotiates and owns direct links to other participants, one per address.
#[derive(Clone)]
pub struct PeerSignalingChannel {
    inner: Arc<SignalingInner>,
}

impl PeerSignalingChannel {
    pub fn new(
        transport: ChannelTransport,
        connector: Arc<dyn PeerConnector>,
        ice_servers: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = SignalingInner {
            transport,
            connector,
            ice_servers,
            links: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Starts negotiating a link to `address` as the offering side.
    ///
    /// Returns once the offer has been handed to the shared channel; the
    /// link reports readiness through [`PeerEvent::DataChannelReady`].
    pub async fn start(&self, address: &Address) -> Result<(), PeerError> {
        let generation = {
            let mut links = self.inner.links.lock();
            if links
                .get(address)
                .is_some_and(|link| link.state != LinkState::Closed)
            {
                return Err(PeerError::AlreadyNegotiating);
            }
            let generation = self.inner.next_generation();
            links.insert(address.clone(), PeerLink::negotiating(generation));
            generation
        };
        info!(target: "couch::peer", peer = %address, generation, "starting peer link");

        let connection = self.inner.open_connection(address, generation).await?;
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.inner.drop_link(address, generation, PeerError::Cancelled);
                return Err(err);
            }
        };
        self.inner
            .relay(address, RelayPayload::Offer { description: offer });
        Ok(())
    }

    /// Handles a negotiation message relayed over the shared channel.
    ///
    /// An offer from a peer that already has a live link fails with
    /// [`PeerError::CrossedOffer`]; glare is not resolved. Undecodable
    /// payloads are dropped.
    pub async fn handle_relay(&self, from: &Address, data: &str) -> Result<(), PeerError> {
        let payload: RelayPayload = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "couch::peer", peer = %from, error = %err, "dropping malformed relay payload");
                return Ok(());
            }
        };
        match payload {
            RelayPayload::Offer { description } => {
                let generation = {
                    let mut links = self.inner.links.lock();
                    if links
                        .get(from)
                        .is_some_and(|link| link.state != LinkState::Closed)
                    {
                        warn!(target: "couch::peer", peer = %from, "rejecting offer for a live link");
                        return Err(PeerError::CrossedOffer);
                    }
                    let generation = self.inner.next_generation();
                    links.insert(from.clone(), PeerLink::negotiating(generation));
                    generation
                };
                let connection = self.inner.open_connection(from, generation).await?;
                match connection.accept_offer(description).await {
                    Ok(answer) => {
                        self.inner
                            .relay(from, RelayPayload::Answer { description: answer });
                        Ok(())
                    }
                    Err(err) => {
                        self.inner
                            .drop_link(from, generation, PeerError::Cancelled);
                        Err(err)
                    }
                }
            }
            RelayPayload::Answer { description } => {
                let Some(connection) = self.inner.connection_for(from) else {
                    debug!(target: "couch::peer", peer = %from, "answer for unknown link");
                    return Ok(());
                };
                if let Err(err) = connection.accept_answer(description).await {
                    warn!(target: "couch::peer", peer = %from, error = %err, "failed to apply answer");
                }
                Ok(())
            }
            RelayPayload::Candidate { candidate } => {
                let Some(connection) = self.inner.connection_for(from) else {
                    trace!(target: "couch::peer", peer = %from, "candidate for unknown link");
                    return Ok(());
                };
                if let Err(err) = connection.add_ice_candidate(candidate).await {
                    warn!(target: "couch::peer", peer = %from, error = %err, "failed to add candidate");
                }
                Ok(())
            }
        }
    }

    /// Sends over the first ready link and waits for its ack. There is no
    /// timeout; a lost link fails the wait with [`PeerError::LinkLost`].
    pub async fn send_command(&self, command_type: &str, data: String) -> Result<(), PeerError> {
        let address = self
            .ready_peers()
            .into_iter()
            .next()
            .ok_or(PeerError::NotConnected)?;
        self.send_command_to(&address, command_type, data).await
    }

    pub async fn send_command_to(
        &self,
        address: &Address,
        command_type: &str,
        data: String,
    ) -> Result<(), PeerError> {
        let (connection, acks) = self.inner.ready_link(address)?;
        let (ticket, receiver) = acks.track();
        let id = ticket.id().clone();
        let frame = PeerFrame::Command {
            id: id.clone(),
            command_type: command_type.to_string(),
            data,
        };
        let text = encode(&frame)?;
        connection.send_text(text).await?;
        trace!(target: "couch::peer", peer = %address, id = %id, command_type, "command sent over peer link");
        receiver.await.map_err(|_| PeerError::LinkLost)?
    }

    pub async fn send_command_ack(&self, address: &Address, id: &RequestId) -> Result<(), PeerError> {
        let (connection, _) = self.inner.ready_link(address)?;
        let text = encode(&PeerFrame::Ack { id: id.clone() })?;
        connection.send_text(text).await
    }

    /// Mirrors `status` to every open link.
    pub async fn update_status(&self, status: &StatusMap) {
        let text = match encode(&PeerFrame::Status {
            status: status.clone(),
        }) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "couch::peer", error = %err, "failed to encode status");
                return;
            }
        };
        let connections: Vec<_> = {
            let links = self.inner.links.lock();
            links
                .iter()
                .filter(|(_, link)| link.state == LinkState::Connected)
                .filter_map(|(address, link)| {
                    link.connection
                        .clone()
                        .map(|connection| (address.clone(), connection))
                })
                .collect()
        };
        for (address, connection) in connections {
            if let Err(err) = connection.send_text(text.clone()).await {
                debug!(target: "couch::peer", peer = %address, error = %err, "status mirror failed");
            }
        }
    }

    pub fn is_ready(&self, address: &Address) -> bool {
        self.inner
            .links
            .lock()
            .get(address)
            .is_some_and(|link| link.state == LinkState::Connected)
    }

    pub fn ready_peers(&self) -> Vec<Address> {
        let links = self.inner.links.lock();
        let mut ready: Vec<_> = links
            .iter()
            .filter(|(_, link)| link.state == LinkState::Connected)
            .map(|(address, _)| address.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn has_link(&self, address: &Address) -> bool {
        self.inner
            .links
            .lock()
            .get(address)
            .is_some_and(|link| link.state != LinkState::Closed)
    }

    /// Closes the link to `address` without reporting it as lost.
    pub fn stop(&self, address: &Address) {
        if let Some(link) = self.inner.links.lock().remove(address) {
            debug!(target: "couch::peer", peer = %address, "stopping peer link");
            link.shut(PeerError::Cancelled);
        }
    }

    pub fn stop_all(&self) {
        let links: Vec<_> = self.inner.links.lock().drain().collect();
        for (address, link) in links {
            debug!(target: "couch::peer", peer = %address, "stopping peer link");
            link.shut(PeerError::Cancelled);
        }
    }
}

impl SignalingInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn open_connection(
        self: &Arc<Self>,
        address: &Address,
        generation: u64,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let (connection, events) = match self.connector.create_connection(&self.ice_servers).await
        {
            Ok(parts) => parts,
            Err(err) => {
                self.drop_link(address, generation, PeerError::Cancelled);
                return Err(err);
            }
        };
        let attached = {
            let mut links = self.links.lock();
            match links.get_mut(address) {
                Some(link) if link.generation == generation => {
                    let weak = Arc::downgrade(self);
                    link.pump = Some(tokio::spawn(pump_events(
                        weak,
                        address.clone(),
                        generation,
                        events,
                    )));
                    link.connection = Some(connection.clone());
                    true
                }
                _ => false,
            }
        };
        if !attached {
            debug!(target: "couch::peer", peer = %address, "link stopped during setup");
            tokio::spawn(async move { connection.close().await });
            return Err(PeerError::Cancelled);
        }
        Ok(connection)
    }

    fn drop_link(&self, address: &Address, generation: u64, error: PeerError) {
        let mut links = self.links.lock();
        if links
            .get(address)
            .is_some_and(|link| link.generation == generation)
        {
            if let Some(link) = links.remove(address) {
                link.shut(error);
            }
        }
    }

    fn connection_for(&self, address: &Address) -> Option<Arc<dyn PeerConnection>> {
        self.links
            .lock()
            .get(address)
            .filter(|link| link.state != LinkState::Closed)
            .and_then(|link| link.connection.clone())
    }

    fn ready_link(
        &self,
        address: &Address,
    ) -> Result<(Arc<dyn PeerConnection>, Arc<PendingRequests<(), PeerError>>), PeerError> {
        let links = self.links.lock();
        let link = links
            .get(address)
            .filter(|link| link.state == LinkState::Connected)
            .ok_or(PeerError::NotConnected)?;
        let connection = link.connection.clone().ok_or(PeerError::NotConnected)?;
        Ok((connection, link.acks.clone()))
    }

    /// Sends a negotiation payload over the shared channel without waiting
    /// on the caller; a failed delivery is logged.
    fn relay(&self, to: &Address, payload: RelayPayload) {
        let data = match serde_json::to_string(&payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "couch::peer", error = %err, "failed to encode relay payload");
                return;
            }
        };
        let transport = self.transport.clone();
        let to = to.clone();
        tokio::spawn(async move {
            let result = transport
                .send_request(
                    &to,
                    RequestPayload::Message {
                        message_type: PEER_SIGNAL_MESSAGE.to_string(),
                        data,
                    },
                )
                .await;
            if let Err(err) = result {
                debug!(target: "couch::peer", peer = %to, error = %err, "relay delivery failed");
            }
        });
    }

    fn mark_open(&self, address: &Address, generation: u64) -> bool {
        let mut links = self.links.lock();
        match links.get_mut(address) {
            Some(link) if link.generation == generation && link.state == LinkState::Negotiating => {
                link.state = LinkState::Connected;
                true
            }
            _ => false,
        }
    }

    fn mark_lost(&self, address: &Address, generation: u64, detail: &str) -> bool {
        let mut links = self.links.lock();
        let Some(link) = links
            .get_mut(address)
            .filter(|link| link.generation == generation && link.state != LinkState::Closed)
        else {
            return false;
        };
        warn!(target: "couch::peer", peer = %address, generation, detail, "peer link lost");
        link.state = LinkState::Closed;
        link.acks.reject_all(|| PeerError::LinkLost);
        if let Some(connection) = link.connection.take() {
            tokio::spawn(async move { connection.close().await });
        }
        true
    }

    fn handle_frame(&self, address: &Address, generation: u64, text: &str) {
        let frame: PeerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "couch::peer", peer = %address, error = %err, "dropping malformed peer frame");
                return;
            }
        };
        match frame {
            PeerFrame::Command {
                id,
                command_type,
                data,
            } => {
                let _ = self.events.send(PeerEvent::Command {
                    from: address.clone(),
                    id,
                    command_type,
                    data,
                });
            }
            PeerFrame::Ack { id } => {
                let acks = self
                    .links
                    .lock()
                    .get(address)
                    .filter(|link| link.generation == generation)
                    .map(|link| link.acks.clone());
                if acks.and_then(|acks| acks.resolve(&id, Ok(()))).is_none() {
                    trace!(target: "couch::peer", peer = %address, id = %id, "ack for unknown command");
                }
            }
            PeerFrame::Status { status } => {
                let _ = self.events.send(PeerEvent::Status {
                    from: address.clone(),
                    status,
                });
            }
        }
    }
}

async fn pump_events(
    inner: Weak<SignalingInner>,
    address: Address,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                inner.relay(&address, RelayPayload::Candidate { candidate });
            }
            PeerConnectionEvent::DataChannelOpen => {
                if inner.mark_open(&address, generation) {
                    info!(target: "couch::peer", peer = %address, generation, "peer link ready");
                    let _ = inner.events.send(PeerEvent::DataChannelReady {
                        address: address.clone(),
                        ready: true,
                    });
                }
            }
            PeerConnectionEvent::DataChannelClosed | PeerConnectionEvent::Failed(_) => {
                let detail = match &event {
                    PeerConnectionEvent::Failed(reason) => reason.as_str(),
                    _ => "data channel closed",
                };
                if inner.mark_lost(&address, generation, detail) {
                    let _ = inner.events.send(PeerEvent::DataChannelReady {
                        address: address.clone(),
                        ready: false,
                    });
                }
                return;
            }
            PeerConnectionEvent::Message(text) => inner.handle_frame(&address, generation, &text),
        }
    }
}

fn encode(frame: &PeerFrame) -> Result<String, PeerError> {
    serde_json::to_string(frame).map_err(|err| PeerError::Encode(err.to_string()))
}
