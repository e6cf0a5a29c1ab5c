//! A lightweight remote: pairs with a join code, sends commands and mirrors
//! the controller's last-known status.

use super::CODE_PART_LEN;
use crate::channel::{
    Address, ChannelIdentity, ChannelProfile, Connector, JoinOptions, ParticipantRole,
    PresenceChange, PresenceKind, StatusMap, merge_status,
};
use crate::config::CoreConfig;
use crate::dispatch::{GO_TO_MEETING, IncomingCommand};
use crate::peer::PeerConnector;
use crate::reconnect::ReconnectEvent;
use crate::service::{ChannelSessionService, RoleHandler, SessionError, SessionHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Splits a join code into channel name and secret without contacting
/// anything.
pub fn exchange_code(code: &str) -> Result<ChannelIdentity, SessionError> {
    let code = code.trim();
    let chars: Vec<char> = code.chars().collect();
    if chars.len() != CODE_PART_LEN * 2 {
        return Err(SessionError::InvalidJoinCode);
    }
    let name: String = chars[..CODE_PART_LEN].iter().collect();
    let secret: String = chars[CODE_PART_LEN..].iter().collect();
    Ok(ChannelIdentity::new(name, secret))
}

/// Resolves a user-facing pairing code into channel coordinates, for
/// deployments where codes are not the raw `name + secret`.
#[async_trait]
pub trait PairingExchange: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<ChannelIdentity, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Disconnected,
    ExchangingCode,
    Joined,
    TrackingStatus { controller: Address },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    ControllerFound { address: Address },
    /// The full merged status after an update.
    ControllerStatus { status: StatusMap },
    ControllerLost,
    PeerReady { address: Address, ready: bool },
    Reconnecting,
    Reconnected,
    Unrecoverable { reason: String },
}

struct RemoteShared {
    state: Mutex<RemoteState>,
    status: Mutex<StatusMap>,
    controller: watch::Sender<Option<Address>>,
    events: mpsc::UnboundedSender<RemoteEvent>,
}

impl RemoteShared {
    fn emit(&self, event: RemoteEvent) {
        let _ = self.events.send(event);
    }

    fn controller(&self) -> Option<Address> {
        self.controller.borrow().clone()
    }

    fn reset(&self) {
        *self.state.lock() = RemoteState::Disconnected;
        self.status.lock().clear();
        self.controller.send_replace(None);
    }

    fn merge(&self, partial: StatusMap) {
        let status = {
            let mut status = self.status.lock();
            merge_status(&mut status, partial);
            status.clone()
        };
        self.emit(RemoteEvent::ControllerStatus { status });
    }
}

struct RemoteHandler {
    shared: Arc<RemoteShared>,
    session: SessionHandle,
}

impl RemoteHandler {
    fn is_controller(change: &PresenceChange) -> bool {
        change
            .state
            .get("role")
            .and_then(Value::as_str)
            .is_some_and(|role| role == ParticipantRole::Controller.as_str())
    }
}

#[async_trait]
impl RoleHandler for RemoteHandler {
    async fn on_command(&self, command: &IncomingCommand) -> Result<Value, String> {
        debug!(
            target: "couch::remote",
            from = %command.from,
            command_type = %command.command_type,
            "ignoring command sent to a remote"
        );
        Ok(Value::Null)
    }

    async fn on_presence(&self, change: &PresenceChange) {
        let current = self.shared.controller();
        match change.kind {
            PresenceKind::Joined | PresenceKind::Updated => {
                let is_current = current.as_ref() == Some(&change.from);
                if !is_current && !Self::is_controller(change) {
                    return;
                }
                if !is_current {
                    info!(target: "couch::remote", controller = %change.from, "controller found");
                    self.shared.status.lock().clear();
                    self.shared.controller.send_replace(Some(change.from.clone()));
                    *self.shared.state.lock() = RemoteState::TrackingStatus {
                        controller: change.from.clone(),
                    };
                    self.shared.emit(RemoteEvent::ControllerFound {
                        address: change.from.clone(),
                    });
                    if let Some(peer_supervisor) = &self.session.peer_supervisor {
                        peer_supervisor.activate(change.from.clone());
                    }
                }
                self.shared.merge(change.state.clone());
            }
            PresenceKind::Left | PresenceKind::Errored => {
                if current.as_ref() != Some(&change.from) {
                    return;
                }
                warn!(target: "couch::remote", controller = %change.from, "controller unavailable; disconnecting");
                self.shared.reset();
                self.shared.emit(RemoteEvent::ControllerLost);
                self.session.shutdown().await;
            }
        }
    }

    async fn on_connection(&self, event: &ReconnectEvent) {
        match event {
            ReconnectEvent::Reconnecting => self.shared.emit(RemoteEvent::Reconnecting),
            ReconnectEvent::Reconnected { .. } => self.shared.emit(RemoteEvent::Reconnected),
            ReconnectEvent::Unrecoverable { reason } => {
                self.shared.reset();
                if let Some(peer_supervisor) = &self.session.peer_supervisor {
                    peer_supervisor.deactivate();
                }
                self.shared.emit(RemoteEvent::Unrecoverable {
                    reason: reason.clone(),
                });
            }
        }
    }

    async fn on_peer_ready(&self, address: &Address, ready: bool) {
        self.shared.emit(RemoteEvent::PeerReady {
            address: address.clone(),
            ready,
        });
    }

    async fn on_peer_status(&self, from: &Address, status: &StatusMap) {
        if self.shared.controller().as_ref() == Some(from) {
            self.shared.merge(status.clone());
        }
    }
}

pub struct RemoteRole {
    service: ChannelSessionService,
    shared: Arc<RemoteShared>,
    pairing: Option<Arc<dyn PairingExchange>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RemoteEvent>>>,
}

impl RemoteRole {
    pub fn new(
        connector: Arc<dyn Connector>,
        peer_connector: Option<Arc<dyn PeerConnector>>,
        config: CoreConfig,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (controller, _) = watch::channel(None);
        let shared = Arc::new(RemoteShared {
            state: Mutex::new(RemoteState::Disconnected),
            status: Mutex::new(StatusMap::new()),
            controller,
            events,
        });
        let handler_shared = shared.clone();
        let service = ChannelSessionService::new(connector, peer_connector, &config, move |session| {
            Arc::new(RemoteHandler {
                shared: handler_shared,
                session,
            }) as Arc<dyn RoleHandler>
        });
        Self {
            service,
            shared,
            pairing: None,
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// Resolves codes through `pairing` instead of splitting them locally.
    pub fn with_pairing(mut self, pairing: Arc<dyn PairingExchange>) -> Self {
        self.pairing = Some(pairing);
        self
    }

    /// The event stream; available once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RemoteEvent>> {
        self.events.lock().take()
    }

    pub fn state(&self) -> RemoteState {
        self.shared.state.lock().clone()
    }

    pub fn session(&self) -> &ChannelSessionService {
        &self.service
    }

    pub fn controller(&self) -> Option<Address> {
        self.shared.controller()
    }

    pub fn controller_status(&self) -> StatusMap {
        self.shared.status.lock().clone()
    }

    /// Exchanges `code` for channel coordinates and joins as a remote.
    pub async fn connect(&self, code: &str) -> Result<ChannelProfile, SessionError> {
        *self.shared.state.lock() = RemoteState::ExchangingCode;
        let identity = match &self.pairing {
            Some(pairing) => pairing.exchange(code).await.map_err(SessionError::Pairing),
            None => exchange_code(code),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(err) => {
                *self.shared.state.lock() = RemoteState::Disconnected;
                return Err(err);
            }
        };

        match self.service.join(&identity, &JoinOptions::remote()).await {
            Ok(profile) => {
                info!(target: "couch::remote", channel = %identity.name, address = %profile.address, "remote joined");
                let mut state = self.shared.state.lock();
                if *state == RemoteState::ExchangingCode {
                    *state = RemoteState::Joined;
                }
                Ok(profile)
            }
            Err(err) => {
                *self.shared.state.lock() = RemoteState::Disconnected;
                Err(err)
            }
        }
    }

    /// Waits until a controller has announced itself in the channel.
    pub async fn wait_for_controller(&self, timeout: Duration) -> Result<Address, SessionError> {
        let mut controller = self.shared.controller.subscribe();
        let found = tokio::time::timeout(timeout, controller.wait_for(Option::is_some)).await;
        match found {
            Ok(Ok(address)) => address.clone().ok_or(SessionError::NoController),
            _ => Err(SessionError::NoController),
        }
    }

    /// Sends a command to the controller of record.
    pub async fn send_command(
        &self,
        command_type: &str,
        data: &Value,
    ) -> Result<Value, SessionError> {
        let controller = self.controller().ok_or(SessionError::NoController)?;
        Ok(self
            .service
            .dispatch()
            .send_command(&controller, command_type, data)
            .await?)
    }

    /// Runs `prepare` and then asks the controller to join `meeting`. Only
    /// one such flow may run at a time.
    pub async fn go_to_meeting<P>(&self, meeting: &str, prepare: P) -> Result<Value, SessionError>
    where
        P: Future<Output = Result<(), String>> + Send,
    {
        let controller = self.controller().ok_or(SessionError::NoController)?;
        let meeting = meeting.to_string();
        Ok(self
            .service
            .dispatch()
            .run_exclusive(&controller, GO_TO_MEETING, async move {
                prepare.await?;
                Ok(json!({ "meetingName": meeting }))
            })
            .await?)
    }

    pub async fn disconnect(&self) {
        self.service.leave().await;
        self.shared.reset();
        info!(target: "couch::remote", "remote disconnected");
    }
}
