use super::ChannelIdentity;
use super::wire::{Address, ChannelProfile, PresenceFrame, PresenceType, StatusMap};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Joined,
    Updated,
    Left,
    Errored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    pub from: Address,
    pub kind: PresenceKind,
    pub state: StatusMap,
}

/// Shallow merge: every key in `partial` replaces the key in `target`.
pub fn merge_status(target: &mut StatusMap, partial: StatusMap) {
    for (key, value) in partial {
        target.insert(key, value);
    }
}

/// Live binding to one joined channel. A reconnect always builds a new one.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    identity: ChannelIdentity,
    profile: ChannelProfile,
    participants: HashMap<Address, StatusMap>,
}

impl ChannelSession {
    pub fn new(identity: ChannelIdentity, profile: ChannelProfile) -> Self {
        Self {
            identity,
            profile,
            participants: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: ChannelIdentity) {
        self.identity = identity;
    }

    pub fn profile(&self) -> &ChannelProfile {
        &self.profile
    }

    pub fn local_address(&self) -> &Address {
        &self.profile.address
    }

    pub fn participants(&self) -> impl Iterator<Item = &Address> {
        self.participants.keys()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.participants.contains_key(address)
    }

    pub fn presence_of(&self, address: &Address) -> Option<&StatusMap> {
        self.participants.get(address)
    }

    /// Folds a presence frame into the participant table.
    ///
    /// The relay does not reliably label first-seen presence as a join, so
    /// `Joined` is derived here: the first presence from an address that is
    /// not currently a participant is a join regardless of its wire type.
    /// Presence from ourselves yields `None`, as does a leave from an address
    /// we never saw.
    pub fn observe(&mut self, frame: PresenceFrame) -> Option<PresenceChange> {
        if &frame.from == self.local_address() {
            return None;
        }
        let PresenceFrame { from, kind, state } = frame;
        match kind {
            PresenceType::Join | PresenceType::Update => {
                let first_seen = self.participants.insert(from.clone(), state.clone()).is_none();
                Some(PresenceChange {
                    from,
                    kind: if first_seen {
                        PresenceKind::Joined
                    } else {
                        PresenceKind::Updated
                    },
                    state,
                })
            }
            PresenceType::Unavailable | PresenceType::Error => {
                let last_known = self.participants.remove(&from)?;
                let state = if state.is_empty() { last_known } else { state };
                Some(PresenceChange {
                    from,
                    kind: if kind == PresenceType::Error {
                        PresenceKind::Errored
                    } else {
                        PresenceKind::Left
                    },
                    state,
                })
            }
        }
    }
}
