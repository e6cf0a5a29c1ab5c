use super::connector::{Connection, ConnectionHandle, Connector, DisconnectReason, Inbound};
use super::pending::PendingRequests;
use super::session::{ChannelSession, PresenceChange, merge_status};
use super::wire::{
    Address, ChannelProfile, ClientMessage, Frame, JoinRejection, RequestId, ResponseBody,
    ServerMessage, StatusMap,
};
use super::{ChannelError, ChannelIdentity, JoinOptions};
use crate::config::CoreConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, trace, warn};

/// Outbound request body; `data` is already-serialized JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Command { command_type: String, data: String },
    Message { message_type: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub from: Address,
    pub id: RequestId,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Presence(PresenceChange),
    /// A command or message that expects a [`ChannelTransport::respond`].
    Request(IncomingRequest),
    /// The connection died without a `leave()`. The session is already torn
    /// down and every pending request rejected when this is delivered.
    Disconnected(DisconnectReason),
}

struct ActiveSession {
    generation: u64,
    session: ChannelSession,
    handle: Arc<dyn ConnectionHandle>,
    reader: JoinHandle<()>,
}

struct TransportInner {
    connector: Arc<dyn Connector>,
    request_timeout: Duration,
    join_timeout: Duration,
    conflict_window: Duration,
    conflict_retry_delay: Duration,
    active: Mutex<Option<ActiveSession>>,
    presence: Mutex<StatusMap>,
    pending: PendingRequests<Value, ChannelError>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    generation: AtomicU64,
    join_lock: AsyncMutex<()>,
}

/// Client side of a shared multi-party channel.
///
/// Cheap to clone; clones share one session. Inbound traffic is delivered on
/// the event receiver returned by [`ChannelTransport::new`].
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<TransportInner>,
}

impl ChannelTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &CoreConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = TransportInner {
            connector,
            request_timeout: config.request_timeout,
            join_timeout: config.join_timeout,
            conflict_window: config.conflict_window,
            conflict_retry_delay: config.conflict_retry_delay,
            active: Mutex::new(None),
            presence: Mutex::new(StatusMap::new()),
            pending: PendingRequests::new(),
            events,
            generation: AtomicU64::new(0),
            join_lock: AsyncMutex::new(()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Connects and joins `identity.name` as `options.nickname`.
    ///
    /// Nickname conflicts are retried with the same name every
    /// `conflict_retry_delay` until `conflict_window` has passed since the
    /// first conflict. With `retry_on_unauthorized`, a rejected non-empty
    /// secret is retried exactly once without a secret.
    pub async fn join(
        &self,
        identity: &ChannelIdentity,
        options: &JoinOptions,
    ) -> Result<ChannelProfile, ChannelError> {
        let _join_guard = self.inner.join_lock.lock().await;
        if self.is_joined() {
            return Err(ChannelError::AlreadyJoined);
        }

        let mut secret = identity.secret.clone();
        let mut retried_without_secret = false;
        let mut first_conflict: Option<Instant> = None;
        loop {
            match self.attempt_join(&identity.name, &secret, options).await {
                Ok((connection, profile)) => {
                    let effective = ChannelIdentity::new(identity.name.clone(), secret);
                    self.install(effective, profile.clone(), connection, options);
                    return Ok(profile);
                }
                Err(ChannelError::JoinConflict) => {
                    let started = *first_conflict.get_or_insert_with(Instant::now);
                    let elapsed = started.elapsed();
                    if elapsed >= self.inner.conflict_window {
                        warn!(
                            target: "couch::channel",
                            channel = %identity.name,
                            nickname = %options.nickname,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "nickname conflict did not clear; giving up"
                        );
                        return Err(ChannelError::JoinConflict);
                    }
                    debug!(
                        target: "couch::channel",
                        channel = %identity.name,
                        nickname = %options.nickname,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "nickname conflict; retrying join"
                    );
                    sleep(self.inner.conflict_retry_delay).await;
                }
                Err(ChannelError::Unauthorized)
                    if options.retry_on_unauthorized
                        && !secret.is_empty()
                        && !retried_without_secret =>
                {
                    debug!(
                        target: "couch::channel",
                        channel = %identity.name,
                        "secret rejected; retrying once without a secret"
                    );
                    retried_without_secret = true;
                    secret.clear();
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_join(
        &self,
        channel: &str,
        secret: &str,
        options: &JoinOptions,
    ) -> Result<(Connection, ChannelProfile), ChannelError> {
        let Connection { handle, mut inbound } = self.inner.connector.connect().await?;
        let request = ClientMessage::Join {
            channel: channel.to_string(),
            secret: (!secret.is_empty()).then(|| secret.to_string()),
            nickname: options.nickname.clone(),
            role: options.role,
        };
        if let Err(err) = handle.send(request) {
            handle.disconnect();
            return Err(err);
        }

        let handshake = async {
            while let Some(message) = inbound.recv().await {
                match message {
                    Inbound::Message(ServerMessage::JoinAccepted { profile }) => {
                        return Ok(profile);
                    }
                    Inbound::Message(ServerMessage::JoinRejected { reason, message }) => {
                        return Err(match reason {
                            JoinRejection::Conflict => ChannelError::JoinConflict,
                            JoinRejection::Unauthorized => ChannelError::Unauthorized,
                            JoinRejection::Other => ChannelError::JoinRejected(
                                message.unwrap_or_else(|| "join refused".to_string()),
                            ),
                        });
                    }
                    Inbound::Closed(reason) => {
                        return Err(ChannelError::Setup(format!(
                            "connection closed during join: {reason}"
                        )));
                    }
                    Inbound::Message(other) => {
                        trace!(target: "couch::channel", message = ?other, "ignoring pre-join message");
                    }
                }
            }
            Err(ChannelError::ChannelClosed)
        };

        match timeout(self.inner.join_timeout, handshake).await {
            Ok(Ok(profile)) => Ok((Connection { handle, inbound }, profile)),
            Ok(Err(err)) => {
                handle.disconnect();
                Err(err)
            }
            Err(_) => {
                handle.disconnect();
                Err(ChannelError::JoinTimeout)
            }
        }
    }

    fn install(
        &self,
        identity: ChannelIdentity,
        profile: ChannelProfile,
        connection: Connection,
        options: &JoinOptions,
    ) {
        let Connection { handle, inbound } = connection;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = ChannelSession::new(identity, profile.clone());
        {
            let mut active = self.inner.active.lock();
            let weak = Arc::downgrade(&self.inner);
            let reader = tokio::spawn(run_reader(weak, generation, inbound));
            *active = Some(ActiveSession {
                generation,
                session,
                handle: handle.clone(),
                reader,
            });
        }
        info!(
            target: "couch::channel",
            channel = %profile.name,
            address = %profile.address,
            participants = profile.participants,
            generation,
            "joined channel"
        );

        let snapshot = {
            let mut presence = self.inner.presence.lock();
            presence.insert(
                "role".to_string(),
                Value::String(options.role.as_str().to_string()),
            );
            presence.clone()
        };
        if let Err(err) = handle.send(ClientMessage::Presence { state: snapshot }) {
            warn!(target: "couch::channel", error = %err, "failed to announce presence after join");
        }
    }

    /// Leaves the channel, rejects every pending request with
    /// [`ChannelError::Cancelled`] and clears the presence cache. Calling it
    /// again is a no-op.
    pub async fn leave(&self) {
        if let Some(active) = self.inner.active.lock().take() {
            let _ = active.handle.send(ClientMessage::Leave);
            active.handle.disconnect();
            active.reader.abort();
            info!(
                target: "couch::channel",
                channel = %active.session.profile().name,
                "left channel"
            );
        }
        let rejected = self.inner.pending.reject_all(|| ChannelError::Cancelled);
        if rejected > 0 {
            debug!(target: "couch::channel", rejected, "cancelled pending requests on leave");
        }
        self.inner.presence.lock().clear();
    }

    /// Same cleanup as [`leave`](Self::leave) but keeps the presence cache,
    /// so a later join re-announces it. Used between reconnect attempts.
    pub fn teardown(&self) {
        if let Some(active) = self.inner.active.lock().take() {
            active.handle.disconnect();
            active.reader.abort();
            debug!(
                target: "couch::channel",
                generation = active.generation,
                "tore down channel session"
            );
        }
        self.inner.pending.reject_all(|| ChannelError::Disconnected);
    }

    /// Sends a correlated request and waits for its response.
    ///
    /// Fails with [`ChannelError::RequestTimeout`] when no response arrives
    /// within the request timeout; the pending entry is dropped so a late
    /// response is ignored.
    pub async fn send_request(
        &self,
        to: &Address,
        payload: RequestPayload,
    ) -> Result<Value, ChannelError> {
        let (handle, from) = self.current_handle()?;
        let (ticket, receiver) = self.inner.pending.track();
        let id = ticket.id().clone();
        let frame = match payload {
            RequestPayload::Command { command_type, data } => Frame::Command {
                from,
                id: id.clone(),
                command_type,
                data,
            },
            RequestPayload::Message { message_type, data } => Frame::Message {
                from,
                id: id.clone(),
                message_type,
                data,
            },
        };
        trace!(target: "couch::channel", to = %to, id = %id, "sending request");
        handle.send(ClientMessage::Frame {
            to: to.clone(),
            frame,
        })?;

        // `ticket` drops the entry on every exit, including a dropped future.
        match timeout(self.inner.request_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Cancelled),
            Err(_) => {
                warn!(target: "couch::channel", to = %to, id = %id, "request timed out");
                Err(ChannelError::RequestTimeout)
            }
        }
    }

    pub fn respond(
        &self,
        to: &Address,
        id: &RequestId,
        body: ResponseBody,
    ) -> Result<(), ChannelError> {
        let (handle, from) = self.current_handle()?;
        handle.send(ClientMessage::Frame {
            to: to.clone(),
            frame: Frame::Response {
                from,
                id: id.clone(),
                body,
            },
        })
    }

    /// Merges `partial` into the presence cache and broadcasts the whole
    /// cache. When not joined the merge still happens and the next join
    /// announces it.
    pub fn publish_status(&self, partial: StatusMap) -> Result<(), ChannelError> {
        let snapshot = {
            let mut presence = self.inner.presence.lock();
            merge_status(&mut presence, partial);
            presence.clone()
        };
        match self.current_handle() {
            Ok((handle, _)) => handle.send(ClientMessage::Presence { state: snapshot }),
            Err(_) => Ok(()),
        }
    }

    pub fn status(&self) -> StatusMap {
        self.inner.presence.lock().clone()
    }

    /// Relocks the joined channel with a new secret.
    pub fn set_secret(&self, secret: &str) -> Result<(), ChannelError> {
        let handle = {
            let mut active = self.inner.active.lock();
            let active = active.as_mut().ok_or(ChannelError::NotJoined)?;
            let name = active.session.identity().name.clone();
            active
                .session
                .set_identity(ChannelIdentity::new(name, secret));
            active.handle.clone()
        };
        handle.send(ClientMessage::UpdateSecret {
            secret: secret.to_string(),
        })
    }

    pub fn is_joined(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    pub fn local_address(&self) -> Option<Address> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.session.local_address().clone())
    }

    pub fn profile(&self) -> Option<ChannelProfile> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.session.profile().clone())
    }

    pub fn identity(&self) -> Option<ChannelIdentity> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.session.identity().clone())
    }

    pub fn participants(&self) -> Vec<Address> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.session.participants().cloned().collect())
            .unwrap_or_default()
    }

    pub fn presence_of(&self, address: &Address) -> Option<StatusMap> {
        self.inner
            .active
            .lock()
            .as_ref()
            .and_then(|active| active.session.presence_of(address).cloned())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn current_handle(&self) -> Result<(Arc<dyn ConnectionHandle>, Address), ChannelError> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| {
                (
                    active.handle.clone(),
                    active.session.local_address().clone(),
                )
            })
            .ok_or(ChannelError::NotJoined)
    }
}

impl TransportInner {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn handle_message(&self, generation: u64, message: ServerMessage) {
        if !self.is_current(generation) {
            trace!(target: "couch::channel", generation, "dropping message from stale session");
            return;
        }
        match message {
            ServerMessage::Frame { frame } => self.handle_frame(frame),
            ServerMessage::Presence { presence } => {
                let change = {
                    let mut active = self.active.lock();
                    match active.as_mut() {
                        Some(active) if active.generation == generation => {
                            active.session.observe(presence)
                        }
                        _ => None,
                    }
                };
                if let Some(change) = change {
                    debug!(
                        target: "couch::channel",
                        from = %change.from,
                        kind = ?change.kind,
                        "presence changed"
                    );
                    let _ = self.events.send(ChannelEvent::Presence(change));
                }
            }
            ServerMessage::Error { message } => {
                warn!(target: "couch::channel", message = %message, "relay reported an error");
            }
            ServerMessage::Pong => trace!(target: "couch::channel", "pong"),
            other => {
                trace!(target: "couch::channel", message = ?other, "ignoring unexpected message");
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response { from, id, body } => {
                let result = match body {
                    ResponseBody::Ok { data } => Ok(data),
                    ResponseBody::Error { reason } => Err(ChannelError::Remote(reason)),
                };
                match self.pending.resolve(&id, result) {
                    Some(age) => trace!(
                        target: "couch::channel",
                        from = %from,
                        id = %id,
                        latency_ms = age.as_millis() as u64,
                        "response matched"
                    ),
                    None => debug!(
                        target: "couch::channel",
                        from = %from,
                        id = %id,
                        "response for unknown or expired request"
                    ),
                }
            }
            Frame::Command {
                from,
                id,
                command_type,
                data,
            } => {
                let _ = self.events.send(ChannelEvent::Request(IncomingRequest {
                    from,
                    id,
                    payload: RequestPayload::Command { command_type, data },
                }));
            }
            Frame::Message {
                from,
                id,
                message_type,
                data,
            } => {
                let _ = self.events.send(ChannelEvent::Request(IncomingRequest {
                    from,
                    id,
                    payload: RequestPayload::Message { message_type, data },
                }));
            }
        }
    }

    fn handle_closed(&self, generation: u64, reason: DisconnectReason) {
        let active = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if current.generation == generation => active.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            return;
        };
        active.handle.disconnect();
        let rejected = self.pending.reject_all(|| ChannelError::Disconnected);
        warn!(
            target: "couch::channel",
            channel = %active.session.profile().name,
            reason = %reason,
            rejected,
            "channel connection lost"
        );
        let _ = self.events.send(ChannelEvent::Disconnected(reason));
    }
}

async fn run_reader(
    inner: Weak<TransportInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match message {
            Inbound::Message(message) => inner.handle_message(generation, message),
            Inbound::Closed(reason) => {
                inner.handle_closed(generation, reason);
                return;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.handle_closed(generation, DisconnectReason::network("connection dropped"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::channel::session::PresenceKind;
    use serde_json::json;

    fn transport(hub: &MemoryHub) -> (ChannelTransport, mpsc::UnboundedReceiver<ChannelEvent>) {
        ChannelTransport::new(Arc::new(hub.clone()), &CoreConfig::default())
    }

    fn status(value: serde_json::Value) -> StatusMap {
        value.as_object().cloned().unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_status_merges_never_replaces() {
        let hub = MemoryHub::new();
        let (tv, _events) = transport(&hub);
        tv.join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        tv.publish_status(status(json!({"a": 1}))).unwrap();
        tv.publish_status(status(json!({"b": 2}))).unwrap();
        let cache = tv.status();
        assert_eq!(cache.get("a"), Some(&json!(1)));
        assert_eq!(cache.get("b"), Some(&json!(2)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_join_is_rejected_while_joined() {
        let hub = MemoryHub::new();
        let (tv, _events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        let err = tv
            .join(&identity, &JoinOptions::controller())
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::AlreadyJoined);
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_rejects_pending_and_is_idempotent() {
        let hub = MemoryHub::new();
        let (tv, _tv_events) = transport(&hub);
        let (remote, _remote_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        remote.join(&identity, &JoinOptions::remote()).await.unwrap();

        let tv_address = tv.local_address().unwrap();
        let sender = remote.clone();
        let request = tokio::spawn(async move {
            sender
                .send_request(
                    &tv_address,
                    RequestPayload::Command {
                        command_type: "hangUp".into(),
                        data: "{}".into(),
                    },
                )
                .await
        });
        while remote.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        remote.leave().await;
        remote.leave().await;

        assert_eq!(request.await.unwrap(), Err(ChannelError::Cancelled));
        assert_eq!(remote.pending_requests(), 0);
        assert!(!remote.is_joined());
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn unanswered_request_times_out() {
        let hub = MemoryHub::new();
        let (tv, _tv_events) = transport(&hub);
        let (remote, _remote_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        remote.join(&identity, &JoinOptions::remote()).await.unwrap();

        let err = remote
            .send_request(
                &tv.local_address().unwrap(),
                RequestPayload::Message {
                    message_type: "ping".into(),
                    data: "{}".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::RequestTimeout);
        assert_eq!(remote.pending_requests(), 0);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn abandoned_request_leaves_no_pending_entry() {
        let hub = MemoryHub::new();
        let (tv, _tv_events) = transport(&hub);
        let (remote, _remote_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        remote.join(&identity, &JoinOptions::remote()).await.unwrap();

        let tv_address = tv.local_address().unwrap();
        let request = remote.send_request(
            &tv_address,
            RequestPayload::Message {
                message_type: "ping".into(),
                data: "{}".into(),
            },
        );
        let abandoned = tokio::time::timeout(Duration::from_millis(100), request).await;
        assert!(abandoned.is_err());
        assert_eq!(remote.pending_requests(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn presence_is_delivered_with_synthesized_join() {
        let hub = MemoryHub::new();
        let (tv, _tv_events) = transport(&hub);
        let (remote, mut remote_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        remote.join(&identity, &JoinOptions::remote()).await.unwrap();

        let Some(ChannelEvent::Presence(first)) = remote_events.recv().await else {
            panic!("expected presence");
        };
        assert_eq!(first.kind, PresenceKind::Joined);
        assert_eq!(first.state.get("role"), Some(&json!("controller")));

        tv.publish_status(status(json!({"inMeeting": "room1"}))).unwrap();
        let Some(ChannelEvent::Presence(update)) = remote_events.recv().await else {
            panic!("expected presence");
        };
        assert_eq!(update.kind, PresenceKind::Updated);
        assert_eq!(update.state.get("inMeeting"), Some(&json!("room1")));
    }

    #[test_timeout::tokio_timeout_test(120, paused)]
    async fn conflict_past_window_fails_join() {
        let hub = MemoryHub::new();
        let (first, _first_events) = transport(&hub);
        let (second, _second_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        first.join(&identity, &JoinOptions::controller()).await.unwrap();

        let started = Instant::now();
        let err = second
            .join(&identity, &JoinOptions::controller())
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::JoinConflict);
        assert!(started.elapsed() >= Duration::from_secs(35));
        assert!(started.elapsed() < Duration::from_secs(40));
    }

    #[test_timeout::tokio_timeout_test(120, paused)]
    async fn conflict_that_clears_inside_window_joins() {
        let hub = MemoryHub::new();
        let (first, _first_events) = transport(&hub);
        let (second, _second_events) = transport(&hub);
        let identity = ChannelIdentity::new("abc", "123");
        first.join(&identity, &JoinOptions::controller()).await.unwrap();

        let leaver = first.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            leaver.leave().await;
        });
        let profile = second
            .join(&identity, &JoinOptions::controller())
            .await
            .unwrap();
        assert_eq!(profile.address.nickname(), "tv");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unauthorized_retries_once_without_secret() {
        let hub = MemoryHub::new();
        let (transport_a, _events) = transport(&hub);
        let options = JoinOptions {
            retry_on_unauthorized: true,
            ..JoinOptions::controller()
        };
        // The hub refuses any secret for channels it has marked open.
        hub.open_channel("abc");
        let profile = transport_a
            .join(&ChannelIdentity::new("abc", "999"), &options)
            .await
            .unwrap();
        assert_eq!(profile.name, "abc");
        assert_eq!(transport_a.identity().unwrap().secret, "");
    }

    #[test_timeout::tokio_timeout_test]
    async fn wrong_secret_is_unauthorized() {
        let hub = MemoryHub::new();
        let (tv, _tv_events) = transport(&hub);
        let (remote, _remote_events) = transport(&hub);
        tv.join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        let err = remote
            .join(&ChannelIdentity::new("abc", "000"), &JoinOptions::remote())
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Unauthorized);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_connection_emits_disconnected() {
        let hub = MemoryHub::new();
        let (tv, mut events) = transport(&hub);
        tv.join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        hub.drop_participant(&tv.local_address().unwrap());
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ChannelEvent::Disconnected(_)));
        assert!(!tv.is_joined());
    }
}
