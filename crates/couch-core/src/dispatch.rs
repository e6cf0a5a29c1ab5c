//! Request/ack envelope shared by both roles.

use crate::channel::{
    Address, ChannelError, ChannelTransport, RequestId, RequestPayload, ResponseBody,
};
use crate::peer::{PeerError, PeerSignalingChannel};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, trace};

pub const GO_TO_MEETING: &str = "goToMeeting";
pub const HANG_UP: &str = "hangUp";
pub const SET_AUDIO_MUTE: &str = "setAudioMute";
pub const SET_VIDEO_MUTE: &str = "setVideoMute";
pub const SET_SCREENSHARING: &str = "setScreensharing";
pub const SET_TILE_VIEW: &str = "setTileView";
pub const SUBMIT_FEEDBACK: &str = "submitFeedback";

/// Commands that only mean something while the controller is in a meeting.
pub fn requires_active_session(command_type: &str) -> bool {
    matches!(
        command_type,
        HANG_UP | SET_AUDIO_MUTE | SET_VIDEO_MUTE | SET_SCREENSHARING | SET_TILE_VIEW
    )
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("another deferred operation is already in progress")]
    OperationInProgress,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("failed to encode command data: {0}")]
    Serialize(String),
    #[error("preparation failed: {0}")]
    Preparation(String),
}

/// Which path a command arrived on; its ack goes back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRoute {
    Channel,
    Peer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCommand {
    pub from: Address,
    pub id: RequestId,
    pub command_type: String,
    pub data: Value,
    pub route: CommandRoute,
}

impl IncomingCommand {
    /// Parses the serialized `data` of a received command. An empty payload
    /// decodes to `null`.
    pub fn decode(
        from: Address,
        id: RequestId,
        command_type: String,
        data: &str,
        route: CommandRoute,
    ) -> Result<Self, ChannelError> {
        let data = if data.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(data).map_err(|err| ChannelError::MalformedFrame(err.to_string()))?
        };
        Ok(Self {
            from,
            id,
            command_type,
            data,
            route,
        })
    }
}

/// Held for the lifetime of a deferred flow; dropping it frees the slot.
#[derive(Debug)]
pub struct DeferredFlowGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for DeferredFlowGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::SeqCst);
    }
}

/// Sends commands over a ready peer link when one exists and over the
/// shared channel otherwise, and acks received commands on the path they
/// came in on.
#[derive(Clone)]
pub struct CommandDispatchService {
    transport: ChannelTransport,
    peers: Option<PeerSignalingChannel>,
    deferred: Arc<AtomicBool>,
}

impl CommandDispatchService {
    pub fn new(transport: ChannelTransport, peers: Option<PeerSignalingChannel>) -> Self {
        Self {
            transport,
            peers,
            deferred: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    pub fn peers(&self) -> Option<&PeerSignalingChannel> {
        self.peers.as_ref()
    }

    /// Sends `command_type` to `to`. Resolves with the response data; a
    /// peer-link ack carries none and resolves with `null`.
    pub async fn send_command(
        &self,
        to: &Address,
        command_type: &str,
        data: &Value,
    ) -> Result<Value, DispatchError> {
        let encoded =
            serde_json::to_string(data).map_err(|err| DispatchError::Serialize(err.to_string()))?;

        if let Some(peers) = self.peers.as_ref().filter(|peers| peers.is_ready(to)) {
            match peers
                .send_command_to(to, command_type, encoded.clone())
                .await
            {
                Ok(()) => {
                    trace!(target: "couch::dispatch", to = %to, command_type, "command acked over peer link");
                    return Ok(Value::Null);
                }
                Err(PeerError::NotConnected | PeerError::LinkLost) => {
                    debug!(
                        target: "couch::dispatch",
                        to = %to,
                        command_type,
                        "peer link unavailable; falling back to shared channel"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        let response = self
            .transport
            .send_request(
                to,
                RequestPayload::Command {
                    command_type: command_type.to_string(),
                    data: encoded,
                },
            )
            .await?;
        Ok(response)
    }

    pub async fn send_message(
        &self,
        to: &Address,
        message_type: &str,
        data: &Value,
    ) -> Result<Value, DispatchError> {
        let encoded =
            serde_json::to_string(data).map_err(|err| DispatchError::Serialize(err.to_string()))?;
        let response = self
            .transport
            .send_request(
                to,
                RequestPayload::Message {
                    message_type: message_type.to_string(),
                    data: encoded,
                },
            )
            .await?;
        Ok(response)
    }

    /// Claims the single deferred-flow slot, or fails fast.
    pub fn begin_deferred(&self) -> Result<DeferredFlowGuard, DispatchError> {
        if self
            .deferred
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DispatchError::OperationInProgress);
        }
        Ok(DeferredFlowGuard {
            slot: self.deferred.clone(),
        })
    }

    pub fn deferred_in_progress(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    /// Runs a local preparation step and then sends the command built from
    /// its output, holding the deferred-flow slot throughout.
    pub async fn run_exclusive<P>(
        &self,
        to: &Address,
        command_type: &str,
        prepare: P,
    ) -> Result<Value, DispatchError>
    where
        P: Future<Output = Result<Value, String>> + Send,
    {
        let _guard = self.begin_deferred()?;
        let data = prepare.await.map_err(DispatchError::Preparation)?;
        self.send_command(to, command_type, &data).await
    }

    /// Returns whether `command` should reach the role's handler. Commands
    /// needing an active session are dropped with an error log otherwise.
    pub fn admit(&self, command: &IncomingCommand, has_active_session: bool) -> bool {
        if requires_active_session(&command.command_type) && !has_active_session {
            error!(
                target: "couch::dispatch",
                from = %command.from,
                command_type = %command.command_type,
                "dropping command: no active session"
            );
            return false;
        }
        true
    }

    /// Acknowledges `command` on the path it arrived on. Peer acks carry no
    /// data.
    pub async fn ack(&self, command: &IncomingCommand, body: ResponseBody) -> Result<(), DispatchError> {
        match command.route {
            CommandRoute::Channel => self.transport.respond(&command.from, &command.id, body)?,
            CommandRoute::Peer => {
                let peers = self.peers.as_ref().ok_or(PeerError::NotConnected)?;
                peers.send_command_ack(&command.from, &command.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, ChannelIdentity, JoinOptions, MemoryHub};
    use crate::config::CoreConfig;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[test]
    fn active_session_commands() {
        assert!(requires_active_session(SET_AUDIO_MUTE));
        assert!(requires_active_session(HANG_UP));
        assert!(!requires_active_session(GO_TO_MEETING));
        assert!(!requires_active_session(SUBMIT_FEEDBACK));
    }

    #[test]
    fn malformed_data_fails_decode() {
        let result = IncomingCommand::decode(
            Address::from("abc/r"),
            RequestId::from("1"),
            SET_AUDIO_MUTE.into(),
            "{not json",
            CommandRoute::Channel,
        );
        assert!(matches!(result, Err(ChannelError::MalformedFrame(_))));
        let empty = IncomingCommand::decode(
            Address::from("abc/r"),
            RequestId::from("1"),
            HANG_UP.into(),
            "",
            CommandRoute::Channel,
        )
        .unwrap();
        assert_eq!(empty.data, Value::Null);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_deferred_flow_fails_fast() {
        let hub = MemoryHub::new();
        let (transport, _events) = ChannelTransport::new(Arc::new(hub), &CoreConfig::default());
        let dispatch = CommandDispatchService::new(transport, None);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = {
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                dispatch
                    .run_exclusive(&Address::from("abc/tv"), GO_TO_MEETING, async move {
                        let _ = release_rx.await;
                        Err("media unavailable".to_string())
                    })
                    .await
            })
        };
        while !dispatch.deferred_in_progress() {
            tokio::task::yield_now().await;
        }
        let second = dispatch
            .run_exclusive(&Address::from("abc/tv"), GO_TO_MEETING, async {
                Ok(json!({}))
            })
            .await;
        assert_eq!(second, Err(DispatchError::OperationInProgress));

        release_tx.send(()).unwrap();
        assert_eq!(
            first.await.unwrap(),
            Err(DispatchError::Preparation("media unavailable".into()))
        );
        assert!(!dispatch.deferred_in_progress());
        assert!(dispatch.begin_deferred().is_ok());
    }

    #[test_timeout::tokio_timeout_test]
    async fn command_round_trips_over_shared_channel() {
        let hub = MemoryHub::new();
        let config = CoreConfig::default();
        let identity = ChannelIdentity::new("abc", "123");
        let (tv, mut tv_events) = ChannelTransport::new(Arc::new(hub.clone()), &config);
        let (remote, _remote_events) = ChannelTransport::new(Arc::new(hub.clone()), &config);
        tv.join(&identity, &JoinOptions::controller()).await.unwrap();
        remote.join(&identity, &JoinOptions::remote()).await.unwrap();

        let tv_dispatch = CommandDispatchService::new(tv.clone(), None);
        let handler = tokio::spawn(async move {
            loop {
                if let Some(ChannelEvent::Request(request)) = tv_events.recv().await {
                    let RequestPayload::Command { command_type, data } = request.payload else {
                        continue;
                    };
                    let command = IncomingCommand::decode(
                        request.from,
                        request.id,
                        command_type,
                        &data,
                        CommandRoute::Channel,
                    )
                    .unwrap();
                    tv_dispatch
                        .ack(&command, ResponseBody::Ok { data: json!({"ok": true}) })
                        .await
                        .unwrap();
                    return command;
                }
            }
        });

        let remote_dispatch = CommandDispatchService::new(remote, None);
        let response = remote_dispatch
            .send_command(&tv.local_address().unwrap(), SET_AUDIO_MUTE, &json!({"mute": true}))
            .await
            .unwrap();
        assert_eq!(response, json!({"ok": true}));
        let command = handler.await.unwrap();
        assert_eq!(command.command_type, SET_AUDIO_MUTE);
        assert_eq!(command.data, json!({"mute": true}));
    }
}
