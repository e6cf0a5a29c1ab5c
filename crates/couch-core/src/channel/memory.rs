//! In-process relay. Behaves like `couch-road` for everything a participant
//! can observe, and adds hooks to drop connections or fail connects.

use super::connector::{
    Connection, ConnectionHandle, Connector, DisconnectKind, DisconnectReason, Inbound,
};
use super::wire::{
    Address, ChannelProfile, ClientMessage, Frame, JoinRejection, ParticipantRole, PresenceFrame,
    PresenceType, ResponseBody, ServerMessage, StatusMap,
};
use super::ChannelError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const RECIPIENT_UNAVAILABLE: &str = "recipient-unavailable";

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Room>,
    next_connection: u64,
    connects: usize,
    fail_next: usize,
}

#[derive(Default)]
struct Room {
    secret: Option<String>,
    /// Refuses any join that presents a secret.
    open: bool,
    /// Kept when the last member leaves.
    persistent: bool,
    members: HashMap<String, Member>,
}

struct Member {
    connection: u64,
    tx: mpsc::UnboundedSender<Inbound>,
    presence: Option<StatusMap>,
    role: ParticipantRole,
}

impl Room {
    fn broadcast_except(&self, skip: &str, message: ServerMessage) {
        for (nickname, member) in &self.members {
            if nickname != skip {
                let _ = member.tx.send(Inbound::Message(message.clone()));
            }
        }
    }
}

impl HubState {
    fn remove_member(&mut self, channel: &str, nickname: &str, connection: u64) -> Option<Member> {
        let room = self.rooms.get_mut(channel)?;
        if room.members.get(nickname)?.connection != connection {
            return None;
        }
        let member = room.members.remove(nickname)?;
        room.broadcast_except(
            nickname,
            ServerMessage::Presence {
                presence: PresenceFrame {
                    from: Address::new(channel, nickname),
                    kind: PresenceType::Unavailable,
                    state: member.presence.clone().unwrap_or_default(),
                },
            },
        );
        if room.members.is_empty() && !room.persistent {
            self.rooms.remove(channel);
        }
        Some(member)
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a persistent unlocked channel that rejects joins carrying a
    /// secret.
    pub fn open_channel(&self, name: &str) {
        let mut state = self.state.lock();
        let room = state.rooms.entry(name.to_string()).or_default();
        room.secret = None;
        room.open = true;
        room.persistent = true;
    }

    /// Makes the next `count` calls to `connect` fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn members(&self, channel: &str) -> Vec<Address> {
        let state = self.state.lock();
        let mut members: Vec<_> = state
            .rooms
            .get(channel)
            .map(|room| {
                room.members
                    .keys()
                    .map(|nickname| Address::new(channel, nickname))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn role_of(&self, address: &Address) -> Option<ParticipantRole> {
        let state = self.state.lock();
        state
            .rooms
            .get(address.channel())?
            .members
            .get(address.nickname())
            .map(|member| member.role)
    }

    pub fn secret_of(&self, channel: &str) -> Option<String> {
        self.state.lock().rooms.get(channel)?.secret.clone()
    }

    /// Severs `address` as a network failure would.
    pub fn drop_participant(&self, address: &Address) -> bool {
        self.disconnect_participant(
            address,
            DisconnectReason::network("connection dropped by relay"),
        )
    }

    pub fn disconnect_participant(&self, address: &Address, reason: DisconnectReason) -> bool {
        let mut state = self.state.lock();
        let Some(connection) = state
            .rooms
            .get(address.channel())
            .and_then(|room| room.members.get(address.nickname()))
            .map(|member| member.connection)
        else {
            return false;
        };
        let Some(member) = state.remove_member(address.channel(), address.nickname(), connection)
        else {
            return false;
        };
        debug!(target: "couch::memory", address = %address, reason = %reason, "dropping participant");
        let _ = member.tx.send(Inbound::Closed(reason));
        true
    }

    fn join(
        &self,
        connection: u64,
        tx: &mpsc::UnboundedSender<Inbound>,
        channel: &str,
        secret: Option<String>,
        nickname: &str,
        role: ParticipantRole,
    ) -> Result<ChannelProfile, JoinRejection> {
        let mut state = self.state.lock();
        let room = state.rooms.entry(channel.to_string()).or_insert_with(|| Room {
            secret: secret.clone(),
            ..Room::default()
        });
        let authorized = if room.open {
            secret.is_none()
        } else {
            room.secret.is_none() || room.secret == secret
        };
        if !authorized {
            if room.members.is_empty() && !room.persistent {
                state.rooms.remove(channel);
            }
            return Err(JoinRejection::Unauthorized);
        }
        if room.members.contains_key(nickname) {
            return Err(JoinRejection::Conflict);
        }

        room.members.insert(
            nickname.to_string(),
            Member {
                connection,
                tx: tx.clone(),
                presence: None,
                role,
            },
        );
        let profile = ChannelProfile {
            name: channel.to_string(),
            address: Address::new(channel, nickname),
            participants: room.members.len(),
        };
        let _ = tx.send(Inbound::Message(ServerMessage::JoinAccepted {
            profile: profile.clone(),
        }));
        for (other, member) in &room.members {
            if other == nickname {
                continue;
            }
            if let Some(presence) = &member.presence {
                let _ = tx.send(Inbound::Message(ServerMessage::Presence {
                    presence: PresenceFrame {
                        from: Address::new(channel, other),
                        kind: PresenceType::Update,
                        state: presence.clone(),
                    },
                }));
            }
        }
        Ok(profile)
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        let id = {
            let mut state = self.state.lock();
            state.connects += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ChannelError::Setup("relay unreachable".into()));
            }
            state.next_connection += 1;
            state.next_connection
        };
        let (tx, inbound) = mpsc::unbounded_channel();
        let handle = MemoryConnection {
            hub: self.clone(),
            id,
            tx,
            joined: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        Ok(Connection {
            handle: Arc::new(handle),
            inbound,
        })
    }
}

struct MemoryConnection {
    hub: MemoryHub,
    id: u64,
    tx: mpsc::UnboundedSender<Inbound>,
    /// `(channel, nickname)` once joined.
    joined: Mutex<Option<(String, String)>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(Inbound::Message(message));
    }

    fn route(&self, channel: &str, nickname: &str, to: Address, frame: Frame) {
        let sender = Address::new(channel, nickname);
        let frame = frame.with_sender(&sender);
        let state = self.hub.state.lock();
        let target = state
            .rooms
            .get(to.channel())
            .filter(|_| to.channel() == channel)
            .and_then(|room| room.members.get(to.nickname()));
        match (target, &frame) {
            (Some(member), _) => {
                let _ = member.tx.send(Inbound::Message(ServerMessage::Frame { frame }));
            }
            (None, Frame::Command { id, .. } | Frame::Message { id, .. }) => {
                trace!(target: "couch::memory", to = %to, "recipient unavailable");
                self.reply(ServerMessage::Frame {
                    frame: Frame::Response {
                        from: to.clone(),
                        id: id.clone(),
                        body: ResponseBody::Error {
                            reason: RECIPIENT_UNAVAILABLE.to_string(),
                        },
                    },
                });
            }
            (None, Frame::Response { .. }) => {}
        }
    }

    fn leave(&self) {
        if let Some((channel, nickname)) = self.joined.lock().take() {
            self.hub
                .state
                .lock()
                .remove_member(&channel, &nickname, self.id);
        }
    }

    fn member_of(&self) -> Option<(String, String)> {
        let joined = self.joined.lock().clone()?;
        let state = self.hub.state.lock();
        let still_member = state
            .rooms
            .get(&joined.0)
            .and_then(|room| room.members.get(&joined.1))
            .is_some_and(|member| member.connection == self.id);
        still_member.then_some(joined)
    }
}

impl ConnectionHandle for MemoryConnection {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }
        match message {
            ClientMessage::Join {
                channel,
                secret,
                nickname,
                role,
            } => {
                if self.joined.lock().is_some() {
                    self.reply(ServerMessage::Error {
                        message: "already joined".into(),
                    });
                    return Ok(());
                }
                match self
                    .hub
                    .join(self.id, &self.tx, &channel, secret, &nickname, role)
                {
                    Ok(_) => *self.joined.lock() = Some((channel, nickname)),
                    Err(reason) => self.reply(ServerMessage::JoinRejected {
                        reason,
                        message: None,
                    }),
                }
            }
            ClientMessage::Frame { to, frame } => match self.member_of() {
                Some((channel, nickname)) => self.route(&channel, &nickname, to, frame),
                None => self.reply(ServerMessage::Error {
                    message: "not joined".into(),
                }),
            },
            ClientMessage::Presence { state: status } => {
                let Some((channel, nickname)) = self.member_of() else {
                    return Ok(());
                };
                let mut state = self.hub.state.lock();
                let Some(room) = state.rooms.get_mut(&channel) else {
                    return Ok(());
                };
                let Some(member) = room.members.get_mut(&nickname) else {
                    return Ok(());
                };
                let kind = if member.presence.is_none() {
                    PresenceType::Join
                } else {
                    PresenceType::Update
                };
                member.presence = Some(status.clone());
                room.broadcast_except(
                    &nickname,
                    ServerMessage::Presence {
                        presence: PresenceFrame {
                            from: Address::new(&channel, &nickname),
                            kind,
                            state: status,
                        },
                    },
                );
            }
            ClientMessage::UpdateSecret { secret } => {
                if let Some((channel, _)) = self.member_of() {
                    if let Some(room) = self.hub.state.lock().rooms.get_mut(&channel) {
                        room.secret = (!secret.is_empty()).then_some(secret);
                    }
                }
            }
            ClientMessage::Leave => self.leave(),
            ClientMessage::Ping => self.reply(ServerMessage::Pong),
        }
        Ok(())
    }

    fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.leave();
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn joined(hub: &MemoryHub, nickname: &str) -> Connection {
        let connection = hub.connect().await.unwrap();
        connection
            .handle
            .send(ClientMessage::Join {
                channel: "abc".into(),
                secret: Some("123".into()),
                nickname: nickname.into(),
                role: ParticipantRole::Remote,
            })
            .unwrap();
        connection
    }

    async fn next(connection: &mut Connection) -> ServerMessage {
        match connection.inbound.recv().await {
            Some(Inbound::Message(message)) => message,
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_to_missing_recipient_is_answered_with_error() {
        let hub = MemoryHub::new();
        let mut alice = joined(&hub, "alice").await;
        assert!(matches!(next(&mut alice).await, ServerMessage::JoinAccepted { .. }));
        alice
            .handle
            .send(ClientMessage::Frame {
                to: Address::new("abc", "nobody"),
                frame: Frame::Command {
                    from: Address::from("spoof/x"),
                    id: "r1".into(),
                    command_type: "hangUp".into(),
                    data: "{}".into(),
                },
            })
            .unwrap();
        let ServerMessage::Frame { frame } = next(&mut alice).await else {
            panic!("expected frame");
        };
        assert_eq!(
            frame,
            Frame::Response {
                from: Address::new("abc", "nobody"),
                id: "r1".into(),
                body: ResponseBody::Error {
                    reason: RECIPIENT_UNAVAILABLE.into()
                },
            }
        );
    }

    #[tokio::test]
    async fn duplicate_nickname_conflicts() {
        let hub = MemoryHub::new();
        let _first = joined(&hub, "tv").await;
        let mut second = joined(&hub, "tv").await;
        assert_eq!(
            next(&mut second).await,
            ServerMessage::JoinRejected {
                reason: JoinRejection::Conflict,
                message: None
            }
        );
    }

    #[tokio::test]
    async fn disconnect_announces_unavailable() {
        let hub = MemoryHub::new();
        let mut alice = joined(&hub, "alice").await;
        let bob = joined(&hub, "bob").await;
        assert!(matches!(next(&mut alice).await, ServerMessage::JoinAccepted { .. }));
        bob.handle.disconnect();
        let ServerMessage::Presence { presence } = next(&mut alice).await else {
            panic!("expected presence");
        };
        assert_eq!(presence.from, Address::new("abc", "bob"));
        assert_eq!(presence.kind, PresenceType::Unavailable);
        assert_eq!(hub.members("abc"), vec![Address::new("abc", "alice")]);
    }

    #[tokio::test]
    async fn dropped_participant_sees_closed() {
        let hub = MemoryHub::new();
        let mut alice = joined(&hub, "alice").await;
        assert!(matches!(next(&mut alice).await, ServerMessage::JoinAccepted { .. }));
        assert!(hub.drop_participant(&Address::new("abc", "alice")));
        match alice.inbound.recv().await {
            Some(Inbound::Closed(reason)) => assert_eq!(reason.kind, DisconnectKind::Network),
            other => panic!("unexpected inbound: {other:?}"),
        }
        assert!(hub.members("abc").is_empty());
    }
}
