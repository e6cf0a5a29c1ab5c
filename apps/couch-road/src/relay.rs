use couch_core::channel::memory::RECIPIENT_UNAVAILABLE;
use couch_core::channel::wire::{
    ClientMessage, JoinRejection, PresenceFrame, ServerMessage,
};
use couch_core::channel::{Address, ChannelProfile, Frame, PresenceType, ResponseBody, StatusMap};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub type ConnectionId = u64;

struct Member {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    presence: Option<StatusMap>,
}

#[derive(Default)]
struct Room {
    secret: Option<String>,
    members: HashMap<String, Member>,
}

impl Room {
    fn broadcast_except(&self, skip: &str, message: &ServerMessage) {
        for (nickname, member) in &self.members {
            if nickname != skip {
                let _ = member.tx.send(message.clone());
            }
        }
    }
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// `(channel, nickname)` once joined.
    joined: Option<(String, String)>,
    last_seen: Instant,
}

/// Channel state shared by every websocket: rooms keyed by channel name and
/// the live connections.
///
/// Room guards and connection guards are never held at the same time.
#[derive(Default)]
pub struct Relay {
    rooms: DashMap<String, Room>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection; the receiver yields everything the relay sends
    /// to it.
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            ConnectionEntry {
                tx,
                joined: None,
                last_seen: Instant::now(),
            },
        );
        (id, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .get(channel)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn handle(&self, connection: ConnectionId, message: ClientMessage) {
        let Some((tx, joined)) = self.touch(connection) else {
            return;
        };
        match message {
            ClientMessage::Join {
                channel,
                secret,
                nickname,
                role,
            } => {
                if joined.is_some() {
                    let _ = tx.send(ServerMessage::Error {
                        message: "already joined".into(),
                    });
                    return;
                }
                match self.join(connection, &tx, &channel, secret, &nickname) {
                    Ok(profile) => {
                        info!(
                            target: "couch::road",
                            address = %profile.address,
                            role = role.as_str(),
                            participants = profile.participants,
                            "participant joined"
                        );
                        if let Some(mut entry) = self.connections.get_mut(&connection) {
                            entry.joined = Some((channel, nickname));
                        }
                    }
                    Err(reason) => {
                        debug!(target: "couch::road", channel = %channel, ?reason, "join rejected");
                        let _ = tx.send(ServerMessage::JoinRejected {
                            reason,
                            message: None,
                        });
                    }
                }
            }
            ClientMessage::Frame { to, frame } => match joined {
                Some((channel, nickname)) => self.route(&tx, &channel, &nickname, to, frame),
                None => {
                    let _ = tx.send(ServerMessage::Error {
                        message: "not joined".into(),
                    });
                }
            },
            ClientMessage::Presence { state } => {
                if let Some((channel, nickname)) = joined {
                    self.update_presence(&channel, &nickname, connection, state);
                }
            }
            ClientMessage::UpdateSecret { secret } => {
                if let Some((channel, nickname)) = joined {
                    if let Some(mut room) = self.rooms.get_mut(&channel) {
                        room.secret = (!secret.is_empty()).then_some(secret);
                        info!(target: "couch::road", channel = %channel, by = %nickname, "channel secret updated");
                    }
                }
            }
            ClientMessage::Leave => {
                if let Some((channel, nickname)) = joined {
                    if let Some(mut entry) = self.connections.get_mut(&connection) {
                        entry.joined = None;
                    }
                    self.remove_member(&channel, &nickname, connection);
                }
            }
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong);
            }
        }
    }

    pub fn reply(&self, connection: ConnectionId, message: ServerMessage) {
        if let Some(entry) = self.connections.get(&connection) {
            let _ = entry.tx.send(message);
        }
    }

    /// Drops a connection and announces its departure.
    pub fn disconnect(&self, connection: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&connection) else {
            return;
        };
        if let Some((channel, nickname)) = entry.joined {
            self.remove_member(&channel, &nickname, connection);
        }
    }

    /// Disconnects every connection silent for longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect();
        for connection in &stale {
            info!(target: "couch::road", connection, "removing stale connection (heartbeat timeout)");
            self.disconnect(*connection);
        }
        stale.len()
    }

    fn touch(
        &self,
        connection: ConnectionId,
    ) -> Option<(mpsc::UnboundedSender<ServerMessage>, Option<(String, String)>)> {
        let mut entry = self.connections.get_mut(&connection)?;
        entry.last_seen = Instant::now();
        Some((entry.tx.clone(), entry.joined.clone()))
    }

    fn join(
        &self,
        connection: ConnectionId,
        tx: &mpsc::UnboundedSender<ServerMessage>,
        channel: &str,
        secret: Option<String>,
        nickname: &str,
    ) -> Result<ChannelProfile, JoinRejection> {
        let mut room = self
            .rooms
            .entry(channel.to_string())
            .or_insert_with(|| Room {
                secret: secret.clone(),
                ..Room::default()
            });
        if room.secret.is_some() && room.secret != secret {
            let empty = room.members.is_empty();
            drop(room);
            if empty {
                self.rooms.remove_if(channel, |_, room| room.members.is_empty());
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
            },
        );
        let profile = ChannelProfile {
            name: channel.to_string(),
            address: Address::new(channel, nickname),
            participants: room.members.len(),
        };
        let _ = tx.send(ServerMessage::JoinAccepted {
            profile: profile.clone(),
        });
        for (other, member) in &room.members {
            if other == nickname {
                continue;
            }
            if let Some(presence) = &member.presence {
                let _ = tx.send(ServerMessage::Presence {
                    presence: PresenceFrame {
                        from: Address::new(channel, other),
                        kind: PresenceType::Update,
                        state: presence.clone(),
                    },
                });
            }
        }
        Ok(profile)
    }

    fn route(
        &self,
        tx: &mpsc::UnboundedSender<ServerMessage>,
        channel: &str,
        nickname: &str,
        to: Address,
        frame: Frame,
    ) {
        let frame = frame.with_sender(&Address::new(channel, nickname));
        let target = if to.channel() == channel {
            self.rooms
                .get(channel)
                .and_then(|room| room.members.get(to.nickname()).map(|member| member.tx.clone()))
        } else {
            None
        };
        match (target, &frame) {
            (Some(target), _) => {
                trace!(target: "couch::road", to = %to, "frame routed");
                let _ = target.send(ServerMessage::Frame { frame });
            }
            (None, Frame::Command { id, .. } | Frame::Message { id, .. }) => {
                debug!(target: "couch::road", to = %to, "recipient unavailable");
                let _ = tx.send(ServerMessage::Frame {
                    frame: Frame::Response {
                        from: to.clone(),
                        id: id.clone(),
                        body: ResponseBody::Error {
                            reason: RECIPIENT_UNAVAILABLE.to_string(),
                        },
                    },
                });
            }
            (None, Frame::Response { .. }) => {
                trace!(target: "couch::road", to = %to, "dropping response for departed participant");
            }
        }
    }

    fn update_presence(
        &self,
        channel: &str,
        nickname: &str,
        connection: ConnectionId,
        state: StatusMap,
    ) {
        let Some(mut room) = self.rooms.get_mut(channel) else {
            return;
        };
        let Some(member) = room
            .members
            .get_mut(nickname)
            .filter(|member| member.connection == connection)
        else {
            return;
        };
        let kind = if member.presence.is_none() {
            PresenceType::Join
        } else {
            PresenceType::Update
        };
        member.presence = Some(state.clone());
        room.broadcast_except(
            nickname,
            &ServerMessage::Presence {
                presence: PresenceFrame {
                    from: Address::new(channel, nickname),
                    kind,
                    state,
                },
            },
        );
    }

    fn remove_member(&self, channel: &str, nickname: &str, connection: ConnectionId) {
        let empty = {
            let Some(mut room) = self.rooms.get_mut(channel) else {
                return;
            };
            if !matches!(room.members.get(nickname), Some(member) if member.connection == connection) {
                return;
            }
            let Some(member) = room.members.remove(nickname) else {
                return;
            };
            room.broadcast_except(
                nickname,
                &ServerMessage::Presence {
                    presence: PresenceFrame {
                        from: Address::new(channel, nickname),
                        kind: PresenceType::Unavailable,
                        state: member.presence.unwrap_or_default(),
                    },
                },
            );
            room.members.is_empty()
        };
        info!(target: "couch::road", channel = %channel, nickname = %nickname, "participant left");
        if empty {
            self.rooms.remove_if(channel, |_, room| room.members.is_empty());
        }
    }
}
