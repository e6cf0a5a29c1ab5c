//! couch: channel coordination between one controller ("TV") and any number
//! of remotes.
//!
//! Layering, leaf first:
//! - [`channel`]: joins a named multi-party channel, correlates
//!   request/response frames, and tracks presence.
//! - [`reconnect`]: silent, jittered rejoin after unexpected disconnects.
//! - [`peer`]: optional point-to-point data channels negotiated through the
//!   shared channel, plus a per-peer retry supervisor.
//! - [`dispatch`]: the command/ack envelope shared by both paths.
//! - [`service`] and [`roles`]: the session actor and the controller/remote
//!   behaviors composed on top of it.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod peer;
pub mod reconnect;
pub mod roles;
pub mod service;
pub mod store;

pub use channel::{
    Address, ChannelError, ChannelEvent, ChannelIdentity, ChannelProfile, ChannelTransport,
    JoinOptions, ParticipantRole, StatusMap,
};
pub use config::CoreConfig;
pub use dispatch::{CommandDispatchService, DispatchError, IncomingCommand};
pub use peer::{PeerConnector, PeerError, PeerEvent, PeerReconnectSupervisor, PeerSignalingChannel};
pub use reconnect::{ReconnectEvent, ReconnectSupervisor};
pub use roles::controller::{ControllerEvent, ControllerRole, ControllerState};
pub use roles::remote::{PairingExchange, RemoteEvent, RemoteRole, RemoteState, exchange_code};
pub use service::{ChannelSessionService, RoleHandler, SessionError, SessionHandle};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
