//! One session per role: a transport, its reconnect supervisor, optional
//! peer links, and a single actor that routes every inbound event.

use crate::channel::{
    Address, ChannelError, ChannelEvent, ChannelIdentity, ChannelProfile, ChannelTransport,
    Connector, DisconnectReason, IncomingRequest, JoinOptions, PresenceChange, PresenceKind,
    RequestPayload, ResponseBody, StatusMap,
};
use crate::config::CoreConfig;
use crate::dispatch::{CommandDispatchService, CommandRoute, DispatchError, IncomingCommand};
use crate::peer::{
    PEER_SIGNAL_MESSAGE, PeerConnector, PeerEvent, PeerReconnectSupervisor, PeerSignalingChannel,
};
use crate::reconnect::{RandomJitter, ReconnectEvent, ReconnectSupervisor};
use crate::store::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("join code must be exactly 6 characters")]
    InvalidJoinCode,
    #[error("pairing exchange failed: {0}")]
    Pairing(String),
    #[error("no controller present in the channel")]
    NoController,
    #[error("not joined to a channel")]
    NotJoined,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Role-specific behaviour plugged into a [`ChannelSessionService`].
///
/// Every callback runs on the session actor, one at a time.
#[async_trait]
pub trait RoleHandler: Send + Sync + 'static {
    /// Handles an admitted command; `Ok` data becomes the response body.
    async fn on_command(&self, command: &IncomingCommand) -> Result<Value, String>;

    fn has_active_session(&self) -> bool {
        true
    }

    async fn on_presence(&self, _change: &PresenceChange) {}

    /// Messages other than peer negotiation.
    async fn on_message(&self, _from: &Address, _message_type: &str, _data: &str) -> Value {
        Value::Null
    }

    async fn on_connection(&self, _event: &ReconnectEvent) {}

    async fn on_peer_ready(&self, _address: &Address, _ready: bool) {}

    async fn on_peer_status(&self, _from: &Address, _status: &StatusMap) {}

    fn should_reconnect(&self, reason: &DisconnectReason) -> bool {
        reason.is_retryable()
    }
}

/// Cheap handles to every component of a session. Holding one does not
/// keep the session actor alive.
#[derive(Clone)]
pub struct SessionHandle {
    pub transport: ChannelTransport,
    pub supervisor: ReconnectSupervisor,
    pub dispatch: CommandDispatchService,
    pub peers: Option<PeerSignalingChannel>,
    pub peer_supervisor: Option<PeerReconnectSupervisor>,
}

impl SessionHandle {
    pub async fn join(
        &self,
        identity: &ChannelIdentity,
        options: &JoinOptions,
    ) -> Result<ChannelProfile, SessionError> {
        let profile = self.supervisor.join(identity, options).await?;
        if let Some(peer_supervisor) = &self.peer_supervisor {
            peer_supervisor.set_channel_connected(true);
        }
        Ok(profile)
    }

    /// Cancels reconnects, drops every peer link and leaves the channel.
    pub async fn shutdown(&self) {
        self.supervisor.cancel().await;
        if let Some(peer_supervisor) = &self.peer_supervisor {
            peer_supervisor.deactivate();
            peer_supervisor.set_channel_connected(false);
        }
        if let Some(peers) = &self.peers {
            peers.stop_all();
        }
        self.transport.leave().await;
    }
}

pub struct ChannelSessionService {
    handle: SessionHandle,
    actor: JoinHandle<()>,
}

impl ChannelSessionService {
    /// Builds the session and starts its actor. `build_handler` receives the
    /// session's handles so the role can act on them from its callbacks.
    pub fn new<F>(
        connector: Arc<dyn Connector>,
        peer_connector: Option<Arc<dyn PeerConnector>>,
        config: &CoreConfig,
        build_handler: F,
    ) -> Self
    where
        F: FnOnce(SessionHandle) -> Arc<dyn RoleHandler>,
    {
        let (transport, channel_events) = ChannelTransport::new(connector, config);

        let handler_slot: Arc<OnceLock<Arc<dyn RoleHandler>>> = Arc::new(OnceLock::new());
        let predicate_slot = handler_slot.clone();
        let (supervisor, reconnect_events) = ReconnectSupervisor::with_options(
            transport.clone(),
            config.reconnect.clone(),
            Arc::new(RandomJitter),
            Arc::new(move |reason: &DisconnectReason| match predicate_slot.get() {
                Some(handler) => handler.should_reconnect(reason),
                None => reason.is_retryable(),
            }),
        );

        let (peers, peer_events) = match peer_connector {
            Some(connector) => {
                let (peers, events) = PeerSignalingChannel::new(
                    transport.clone(),
                    connector,
                    config.ice_servers.clone(),
                );
                (Some(peers), Some(events))
            }
            None => (None, None),
        };
        let peer_supervisor = peers.as_ref().map(|peers| {
            PeerReconnectSupervisor::new(Arc::new(peers.clone()), config.peer_retry.clone())
        });
        let dispatch = CommandDispatchService::new(transport.clone(), peers.clone());

        let handle = SessionHandle {
            transport,
            supervisor,
            dispatch,
            peers,
            peer_supervisor,
        };
        let handler = build_handler(handle.clone());
        let _ = handler_slot.set(handler.clone());

        let actor = SessionActor {
            handle: handle.clone(),
            handler,
        };
        let actor = tokio::spawn(actor.run(channel_events, peer_events, reconnect_events));
        Self { handle, actor }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.handle.transport
    }

    pub fn dispatch(&self) -> &CommandDispatchService {
        &self.handle.dispatch
    }

    pub async fn join(
        &self,
        identity: &ChannelIdentity,
        options: &JoinOptions,
    ) -> Result<ChannelProfile, SessionError> {
        self.handle.join(identity, options).await
    }

    pub async fn leave(&self) {
        self.handle.shutdown().await;
    }
}

impl Drop for ChannelSessionService {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

struct SessionActor {
    handle: SessionHandle,
    handler: Arc<dyn RoleHandler>,
}

async fn recv_optional<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        self,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
        mut reconnect_events: mpsc::UnboundedReceiver<ReconnectEvent>,
    ) {
        loop {
            tokio::select! {
                event = channel_events.recv() => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => break,
                },
                event = recv_optional(&mut peer_events) => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => peer_events = None,
                },
                event = reconnect_events.recv() => match event {
                    Some(event) => self.on_reconnect_event(event).await,
                    None => break,
                },
            }
        }
        debug!(target: "couch::session", "session actor stopped");
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Presence(change) => {
                if matches!(change.kind, PresenceKind::Left | PresenceKind::Errored) {
                    if let Some(peers) = &self.handle.peers {
                        peers.stop(&change.from);
                    }
                }
                self.handler.on_presence(&change).await;
            }
            ChannelEvent::Request(request) => self.on_request(request).await,
            ChannelEvent::Disconnected(reason) => {
                if let Some(peers) = &self.handle.peers {
                    peers.stop_all();
                }
                if let Some(peer_supervisor) = &self.handle.peer_supervisor {
                    peer_supervisor.set_channel_connected(false);
                }
                self.handle.supervisor.handle_disconnect(&reason);
            }
        }
    }

    async fn on_request(&self, request: IncomingRequest) {
        let IncomingRequest { from, id, payload } = request;
        match payload {
            RequestPayload::Message { message_type, data } if message_type == PEER_SIGNAL_MESSAGE => {
                let body = match &self.handle.peers {
                    Some(peers) => match peers.handle_relay(&from, &data).await {
                        Ok(()) => ResponseBody::empty(),
                        Err(err) => ResponseBody::Error {
                            reason: err.to_string(),
                        },
                    },
                    None => ResponseBody::Error {
                        reason: "peer links are not enabled".into(),
                    },
                };
                self.respond(&from, &id, body);
            }
            RequestPayload::Message { message_type, data } => {
                let data = self.handler.on_message(&from, &message_type, &data).await;
                self.respond(&from, &id, ResponseBody::Ok { data });
            }
            RequestPayload::Command { command_type, data } => {
                match IncomingCommand::decode(
                    from.clone(),
                    id.clone(),
                    command_type,
                    &data,
                    CommandRoute::Channel,
                ) {
                    Ok(command) => self.on_command(command).await,
                    Err(err) => {
                        warn!(target: "couch::session", from = %from, error = %err, "acking malformed command as a no-op");
                        self.respond(&from, &id, ResponseBody::empty());
                    }
                }
            }
        }
    }

    async fn on_command(&self, command: IncomingCommand) {
        let body = if self
            .handle
            .dispatch
            .admit(&command, self.handler.has_active_session())
        {
            match self.handler.on_command(&command).await {
                Ok(data) => ResponseBody::Ok { data },
                Err(reason) => ResponseBody::Error { reason },
            }
        } else {
            ResponseBody::empty()
        };
        if let Err(err) = self.handle.dispatch.ack(&command, body).await {
            warn!(
                target: "couch::session",
                from = %command.from,
                command_type = %command.command_type,
                error = %err,
                "failed to ack command"
            );
        }
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::DataChannelReady { address, ready } => {
                if let Some(peer_supervisor) = &self.handle.peer_supervisor {
                    peer_supervisor.on_ready_update(&address, ready);
                }
                self.handler.on_peer_ready(&address, ready).await;
            }
            PeerEvent::Command {
                from,
                id,
                command_type,
                data,
            } => {
                match IncomingCommand::decode(
                    from.clone(),
                    id.clone(),
                    command_type,
                    &data,
                    CommandRoute::Peer,
                ) {
                    Ok(command) => self.on_command(command).await,
                    Err(err) => {
                        warn!(target: "couch::session", from = %from, error = %err, "acking malformed peer command as a no-op");
                        if let Some(peers) = &self.handle.peers {
                            let _ = peers.send_command_ack(&from, &id).await;
                        }
                    }
                }
            }
            PeerEvent::Status { from, status } => {
                self.handler.on_peer_status(&from, &status).await;
            }
        }
    }

    async fn on_reconnect_event(&self, event: ReconnectEvent) {
        if let Some(peer_supervisor) = &self.handle.peer_supervisor {
            match &event {
                ReconnectEvent::Reconnected { .. } => peer_supervisor.set_channel_connected(true),
                ReconnectEvent::Unrecoverable { .. } => peer_supervisor.set_channel_connected(false),
                ReconnectEvent::Reconnecting => {}
            }
        }
        self.handler.on_connection(&event).await;
    }

    fn respond(&self, to: &Address, id: &crate::channel::RequestId, body: ResponseBody) {
        if let Err(err) = self.handle.transport.respond(to, id, body) {
            debug!(target: "couch::session", to = %to, error = %err, "could not send response");
        }
    }
}
