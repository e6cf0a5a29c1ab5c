//! The controller of record ("TV"): owns the channel, rotates its secret and
//! executes commands sent by remotes.

use super::random_code_part;
use crate::channel::{
    Address, ChannelError, ChannelIdentity, ChannelProfile, Connector, JoinOptions, ParticipantRole,
    PresenceChange, PresenceKind, StatusMap,
};
use crate::config::CoreConfig;
use crate::dispatch::IncomingCommand;
use crate::peer::PeerConnector;
use crate::reconnect::ReconnectEvent;
use crate::service::{ChannelSessionService, RoleHandler, SessionError, SessionHandle};
use crate::store::{KeyValueStore, ReconnectHint};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

/// Status key carrying the code remotes currently need to join.
pub const JOIN_CODE_KEY: &str = "remoteJoinCode";
/// Status key whose non-empty value marks an active meeting.
pub const IN_MEETING_KEY: &str = "inMeeting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Joining,
    Joined { identity: ChannelIdentity },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Joined { join_code: String },
    JoinCodeChanged { join_code: String },
    RemoteJoined { address: Address },
    RemoteLeft { address: Address },
    /// An admitted command. Its ack is sent without waiting on this event.
    Command(IncomingCommand),
    PeerReady { address: Address, ready: bool },
    Reconnecting,
    Reconnected,
    Unrecoverable { reason: String },
}

struct ControllerShared {
    state: Mutex<ControllerState>,
    in_meeting: AtomicBool,
    events: mpsc::UnboundedSender<ControllerEvent>,
    rotation: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerShared {
    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn stop_rotation(&self) {
        if let Some(task) = self.rotation.lock().take() {
            task.abort();
        }
    }
}

struct ControllerHandler {
    shared: Arc<ControllerShared>,
}

#[async_trait]
impl RoleHandler for ControllerHandler {
    async fn on_command(&self, command: &IncomingCommand) -> Result<Value, String> {
        info!(
            target: "couch::controller",
            from = %command.from,
            command_type = %command.command_type,
            "command received"
        );
        self.shared.emit(ControllerEvent::Command(command.clone()));
        Ok(Value::Null)
    }

    fn has_active_session(&self) -> bool {
        self.shared.in_meeting.load(Ordering::SeqCst)
    }

    async fn on_presence(&self, change: &PresenceChange) {
        let is_remote = change
            .state
            .get("role")
            .and_then(Value::as_str)
            .is_some_and(|role| role == ParticipantRole::Remote.as_str());
        match change.kind {
            PresenceKind::Joined if is_remote => {
                info!(target: "couch::controller", remote = %change.from, "remote joined");
                self.shared.emit(ControllerEvent::RemoteJoined {
                    address: change.from.clone(),
                });
            }
            PresenceKind::Left | PresenceKind::Errored => {
                info!(target: "couch::controller", participant = %change.from, "participant left");
                self.shared.emit(ControllerEvent::RemoteLeft {
                    address: change.from.clone(),
                });
            }
            _ => {}
        }
    }

    async fn on_connection(&self, event: &ReconnectEvent) {
        match event {
            ReconnectEvent::Reconnecting => self.shared.emit(ControllerEvent::Reconnecting),
            ReconnectEvent::Reconnected { .. } => self.shared.emit(ControllerEvent::Reconnected),
            ReconnectEvent::Unrecoverable { reason } => {
                self.shared.stop_rotation();
                *self.shared.state.lock() = ControllerState::Disconnected;
                self.shared.emit(ControllerEvent::Unrecoverable {
                    reason: reason.clone(),
                });
            }
        }
    }

    async fn on_peer_ready(&self, address: &Address, ready: bool) {
        self.shared.emit(ControllerEvent::PeerReady {
            address: address.clone(),
            ready,
        });
    }
}

pub struct ControllerRole {
    service: ChannelSessionService,
    shared: Arc<ControllerShared>,
    store: Arc<dyn KeyValueStore>,
    config: CoreConfig,
    events: Mutex<Option<mpsc::UnboundedReceiver<ControllerEvent>>>,
}

impl ControllerRole {
    pub fn new(
        connector: Arc<dyn Connector>,
        peer_connector: Option<Arc<dyn PeerConnector>>,
        store: Arc<dyn KeyValueStore>,
        config: CoreConfig,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ControllerShared {
            state: Mutex::new(ControllerState::Disconnected),
            in_meeting: AtomicBool::new(false),
            events,
            rotation: Mutex::new(None),
        });
        let handler_shared = shared.clone();
        let service = ChannelSessionService::new(connector, peer_connector, &config, move |_| {
            Arc::new(ControllerHandler {
                shared: handler_shared,
            }) as Arc<dyn RoleHandler>
        });
        Self {
            service,
            shared,
            store,
            config,
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// The event stream; available once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControllerEvent>> {
        self.events.lock().take()
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state.lock().clone()
    }

    pub fn join_code(&self) -> Option<String> {
        match &*self.shared.state.lock() {
            ControllerState::Joined { identity } => Some(identity.join_code()),
            _ => None,
        }
    }

    pub fn session(&self) -> &ChannelSessionService {
        &self.service
    }

    /// Joins `identity`, or when `None` resumes a fresh reconnect hint or
    /// creates a random channel. Fails with `AlreadyJoined` unless
    /// disconnected, leaving the current channel untouched.
    pub async fn join(
        &self,
        identity: Option<ChannelIdentity>,
    ) -> Result<ChannelProfile, SessionError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ControllerState::Disconnected {
                return Err(ChannelError::AlreadyJoined.into());
            }
            *state = ControllerState::Joining;
        }
        let identity = identity.unwrap_or_else(|| self.resume_or_generate());

        let profile = match self
            .service
            .join(&identity, &JoinOptions::controller())
            .await
        {
            Ok(profile) => profile,
            Err(err) => {
                *self.shared.state.lock() = ControllerState::Disconnected;
                return Err(err);
            }
        };

        let identity = self
            .service
            .transport()
            .identity()
            .unwrap_or(identity);
        let join_code = identity.join_code();
        info!(
            target: "couch::controller",
            channel = %identity.name,
            address = %profile.address,
            "controller joined"
        );
        self.remember(&identity);
        *self.shared.state.lock() = ControllerState::Joined {
            identity: identity.clone(),
        };
        publish_join_code(self.service.handle(), &join_code).await;
        self.shared.emit(ControllerEvent::Joined { join_code });
        self.start_rotation();
        Ok(profile)
    }

    fn resume_or_generate(&self) -> ChannelIdentity {
        match ReconnectHint::load(self.store.as_ref()) {
            Ok(Some(hint)) if hint.is_fresh(self.config.reconnect_hint_max_age) => {
                info!(target: "couch::controller", channel = %hint.name, "resuming channel from reconnect hint");
                hint.identity()
            }
            Ok(_) => ChannelIdentity::new(random_code_part(), random_code_part()),
            Err(err) => {
                warn!(target: "couch::controller", error = %err, "could not read reconnect hint");
                ChannelIdentity::new(random_code_part(), random_code_part())
            }
        }
    }

    fn remember(&self, identity: &ChannelIdentity) {
        if let Err(err) = ReconnectHint::new(identity).save(self.store.as_ref()) {
            warn!(target: "couch::controller", error = %err, "could not persist reconnect hint");
        }
    }

    fn start_rotation(&self) {
        let period = self.config.secret_rotation;
        if period.is_zero() {
            return;
        }
        let rotator = Rotator {
            handle: self.service.handle().clone(),
            shared: self.shared.clone(),
            store: self.store.clone(),
        };
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(err) = rotator.rotate().await {
                    warn!(target: "couch::controller", error = %err, "secret rotation failed");
                }
            }
        });
        if let Some(previous) = self.shared.rotation.lock().replace(task) {
            previous.abort();
        }
    }

    /// Replaces the channel secret now instead of waiting for the next
    /// rotation tick. Returns the new join code.
    pub async fn rotate_secret(&self) -> Result<String, SessionError> {
        Rotator {
            handle: self.service.handle().clone(),
            shared: self.shared.clone(),
            store: self.store.clone(),
        }
        .rotate()
        .await
    }

    /// Merges `partial` into the published status and mirrors the full
    /// status to every connected peer link.
    pub async fn publish_status(&self, partial: StatusMap) -> Result<(), SessionError> {
        if let Some(value) = partial.get(IN_MEETING_KEY) {
            self.shared
                .in_meeting
                .store(is_active_meeting(value), Ordering::SeqCst);
        }
        let handle = self.service.handle();
        handle.transport.publish_status(partial)?;
        if let Some(peers) = &handle.peers {
            peers.update_status(&handle.transport.status()).await;
        }
        Ok(())
    }

    pub fn has_active_session(&self) -> bool {
        self.shared.in_meeting.load(Ordering::SeqCst)
    }

    /// Clears transient status, forgets the reconnect hint and leaves.
    pub async fn leave(&self) {
        self.shared.stop_rotation();
        let handle = self.service.handle();
        let cleared: StatusMap = handle
            .transport
            .status()
            .keys()
            .filter(|key| key.as_str() != "role")
            .map(|key| (key.clone(), Value::Null))
            .collect();
        if !cleared.is_empty() {
            if let Err(err) = self.publish_status(cleared).await {
                debug!(target: "couch::controller", error = %err, "could not clear status before leaving");
            }
        }
        self.shared.in_meeting.store(false, Ordering::SeqCst);
        if let Err(err) = ReconnectHint::clear(self.store.as_ref()) {
            warn!(target: "couch::controller", error = %err, "could not clear reconnect hint");
        }
        self.service.leave().await;
        *self.shared.state.lock() = ControllerState::Disconnected;
        info!(target: "couch::controller", "controller left");
    }
}

impl Drop for ControllerRole {
    fn drop(&mut self) {
        self.shared.stop_rotation();
    }
}

fn is_active_meeting(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(name) => !name.is_empty(),
        _ => true,
    }
}

async fn publish_join_code(handle: &SessionHandle, join_code: &str) {
    let mut partial = StatusMap::new();
    partial.insert(JOIN_CODE_KEY.to_string(), Value::String(join_code.to_string()));
    if let Err(err) = handle.transport.publish_status(partial) {
        warn!(target: "couch::controller", error = %err, "could not publish join code");
        return;
    }
    if let Some(peers) = &handle.peers {
        peers.update_status(&handle.transport.status()).await;
    }
}

struct Rotator {
    handle: SessionHandle,
    shared: Arc<ControllerShared>,
    store: Arc<dyn KeyValueStore>,
}

impl Rotator {
    async fn rotate(&self) -> Result<String, SessionError> {
        let current = self
            .handle
            .transport
            .identity()
            .ok_or(SessionError::NotJoined)?;
        let secret = random_code_part();
        self.handle.transport.set_secret(&secret)?;

        let identity = ChannelIdentity::new(current.name, secret);
        self.handle.supervisor.update_identity(identity.clone());
        if let Err(err) = ReconnectHint::new(&identity).save(self.store.as_ref()) {
            warn!(target: "couch::controller", error = %err, "could not persist reconnect hint");
        }
        let join_code = identity.join_code();
        *self.shared.state.lock() = ControllerState::Joined { identity };
        publish_join_code(&self.handle, &join_code).await;
        info!(target: "couch::controller", "channel secret rotated");
        self.shared.emit(ControllerEvent::JoinCodeChanged {
            join_code: join_code.clone(),
        });
        Ok(join_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn controller(hub: &MemoryHub, store: Arc<dyn KeyValueStore>, config: CoreConfig) -> ControllerRole {
        ControllerRole::new(Arc::new(hub.clone()), None, store, config)
    }

    #[test_timeout::tokio_timeout_test]
    async fn generates_code_and_persists_hint() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tv = controller(&hub, store.clone(), CoreConfig::default());
        let mut events = tv.take_events().unwrap();

        tv.join(None).await.unwrap();
        let code = tv.join_code().unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(
            events.recv().await,
            Some(ControllerEvent::Joined {
                join_code: code.clone()
            })
        );
        let hint = ReconnectHint::load(store.as_ref()).unwrap().unwrap();
        assert_eq!(hint.identity().join_code(), code);
        assert_eq!(
            tv.session().transport().status().get(JOIN_CODE_KEY),
            Some(&json!(code))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_join_keeps_current_channel() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tv = controller(&hub, store, CoreConfig::default());
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(Some(identity.clone())).await.unwrap();

        let err = tv.join(None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Channel(ChannelError::AlreadyJoined)
        ));
        assert_eq!(tv.state(), ControllerState::Joined {
            identity: identity.clone()
        });
        assert_eq!(tv.join_code().as_deref(), Some("abc123"));
        assert!(tv.session().transport().is_joined());
        assert_eq!(
            tv.session().handle().supervisor.target_identity(),
            Some(identity)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn fresh_hint_is_resumed() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        ReconnectHint::new(&ChannelIdentity::new("xyz", "789"))
            .save(store.as_ref())
            .unwrap();
        let tv = controller(&hub, store, CoreConfig::default());
        tv.join(None).await.unwrap();
        assert_eq!(tv.join_code().as_deref(), Some("xyz789"));
    }

    #[test_timeout::tokio_timeout_test(600, paused)]
    async fn rotation_relocks_channel_and_rebroadcasts() {
        let hub = MemoryHub::new();
        let config = CoreConfig {
            secret_rotation: Duration::from_secs(300),
            ..CoreConfig::default()
        };
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tv = controller(&hub, store.clone(), config);
        let mut events = tv.take_events().unwrap();
        tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
        assert!(matches!(events.recv().await, Some(ControllerEvent::Joined { .. })));

        tokio::time::sleep(Duration::from_secs(301)).await;
        let Some(ControllerEvent::JoinCodeChanged { join_code }) = events.recv().await else {
            panic!("expected a rotated join code");
        };
        assert!(join_code.starts_with("abc"));
        assert_ne!(join_code, "abc123");
        assert_eq!(hub.secret_of("abc").as_deref(), Some(&join_code[3..]));
        assert_eq!(tv.join_code().as_deref(), Some(join_code.as_str()));
        assert_eq!(
            ReconnectHint::load(store.as_ref()).unwrap().unwrap().identity().join_code(),
            join_code
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_clears_status_and_hint() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tv = controller(&hub, store.clone(), CoreConfig::default());
        tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
        tv.publish_status(StatusMap::from_iter([(IN_MEETING_KEY.to_string(), json!("room1"))]))
            .await
            .unwrap();
        assert!(tv.has_active_session());

        tv.leave().await;
        assert!(!tv.has_active_session());
        assert_eq!(tv.state(), ControllerState::Disconnected);
        assert!(ReconnectHint::load(store.as_ref()).unwrap().is_none());
        assert!(hub.members("abc").is_empty());
    }

    #[test]
    fn meeting_values() {
        assert!(is_active_meeting(&json!("room1")));
        assert!(is_active_meeting(&json!(true)));
        assert!(!is_active_meeting(&json!("")));
        assert!(!is_active_meeting(&Value::Null));
    }
}
