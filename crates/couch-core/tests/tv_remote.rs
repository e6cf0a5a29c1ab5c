use couch_core::channel::MemoryHub;
use couch_core::dispatch::{CommandRoute, SET_AUDIO_MUTE};
use couch_core::peer::LoopbackNetwork;
use couch_core::roles::controller::IN_MEETING_KEY;
use couch_core::{
    ChannelIdentity, ControllerEvent, ControllerRole, CoreConfig, KeyValueStore, MemoryStore,
    PeerConnector, RemoteEvent, RemoteRole, RemoteState, StatusMap,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn tv(hub: &MemoryHub, peers: Option<Arc<dyn PeerConnector>>) -> ControllerRole {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    ControllerRole::new(Arc::new(hub.clone()), peers, store, CoreConfig::default())
}

fn remote(hub: &MemoryHub, peers: Option<Arc<dyn PeerConnector>>) -> RemoteRole {
    RemoteRole::new(Arc::new(hub.clone()), peers, CoreConfig::default())
}

fn status(key: &str, value: Value) -> StatusMap {
    StatusMap::from_iter([(key.to_string(), value)])
}

async fn wait_for_status(
    events: &mut UnboundedReceiver<RemoteEvent>,
    key: &str,
    expected: &Value,
) -> StatusMap {
    loop {
        match events.recv().await {
            Some(RemoteEvent::ControllerStatus { status }) if status.get(key) == Some(expected) => {
                return status;
            }
            Some(_) => continue,
            None => panic!("remote event stream closed"),
        }
    }
}

async fn next_command(events: &mut UnboundedReceiver<ControllerEvent>) -> couch_core::IncomingCommand {
    loop {
        match events.recv().await {
            Some(ControllerEvent::Command(command)) => return command,
            Some(_) => continue,
            None => panic!("controller event stream closed"),
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn remote_observes_published_status() {
    let hub = MemoryHub::new();
    let tv = tv(&hub, None);
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();

    let remote = remote(&hub, None);
    let mut events = remote.take_events().unwrap();
    remote.connect("abc123").await.unwrap();
    let controller = remote
        .wait_for_controller(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(controller.as_str(), "abc/tv");
    assert_eq!(
        remote.state(),
        RemoteState::TrackingStatus {
            controller: controller.clone()
        }
    );

    tv.publish_status(status(IN_MEETING_KEY, json!("room1")))
        .await
        .unwrap();
    let seen = wait_for_status(&mut events, IN_MEETING_KEY, &json!("room1")).await;
    assert_eq!(seen.get("role"), Some(&json!("controller")));
    assert_eq!(remote.controller_status().get(IN_MEETING_KEY), Some(&json!("room1")));
}

#[test_timeout::tokio_timeout_test]
async fn command_reaches_controller_and_resolves() {
    let hub = MemoryHub::new();
    let tv = tv(&hub, None);
    let mut tv_events = tv.take_events().unwrap();
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
    tv.publish_status(status(IN_MEETING_KEY, json!("room1")))
        .await
        .unwrap();

    let remote = remote(&hub, None);
    remote.connect("abc123").await.unwrap();
    remote
        .wait_for_controller(Duration::from_secs(5))
        .await
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        remote.send_command(SET_AUDIO_MUTE, &json!({"mute": true})),
    )
    .await
    .expect("command resolves within 5s")
    .unwrap();
    assert_eq!(response, Value::Null);

    let command = next_command(&mut tv_events).await;
    assert_eq!(command.command_type, SET_AUDIO_MUTE);
    assert_eq!(command.data, json!({"mute": true}));
    assert_eq!(command.route, CommandRoute::Channel);
}

#[test_timeout::tokio_timeout_test]
async fn gated_command_without_meeting_is_dropped() {
    let hub = MemoryHub::new();
    let tv = tv(&hub, None);
    let mut tv_events = tv.take_events().unwrap();
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();

    let remote = remote(&hub, None);
    remote.connect("abc123").await.unwrap();
    remote
        .wait_for_controller(Duration::from_secs(5))
        .await
        .unwrap();

    remote
        .send_command(SET_AUDIO_MUTE, &json!({"mute": true}))
        .await
        .unwrap();
    remote
        .go_to_meeting("room2", async { Ok(()) })
        .await
        .unwrap();
    let command = next_command(&mut tv_events).await;
    assert_eq!(command.command_type, "goToMeeting");
    assert_eq!(command.data, json!({"meetingName": "room2"}));
}

#[test_timeout::tokio_timeout_test]
async fn controller_leaving_disconnects_remote() {
    let hub = MemoryHub::new();
    let tv = tv(&hub, None);
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
    tv.publish_status(status(IN_MEETING_KEY, json!("room1")))
        .await
        .unwrap();

    let remote = remote(&hub, None);
    let mut events = remote.take_events().unwrap();
    remote.connect("abc123").await.unwrap();
    wait_for_status(&mut events, IN_MEETING_KEY, &json!("room1")).await;

    tv.leave().await;
    loop {
        match events.recv().await {
            Some(RemoteEvent::ControllerLost) => break,
            Some(_) => continue,
            None => panic!("remote event stream closed"),
        }
    }
    assert_eq!(remote.state(), RemoteState::Disconnected);
    assert!(remote.controller_status().is_empty());
    assert!(!remote.session().transport().is_joined());
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn remote_rejoins_after_network_drop() {
    let hub = MemoryHub::new();
    let tv = tv(&hub, None);
    let mut tv_events = tv.take_events().unwrap();
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
    tv.publish_status(status(IN_MEETING_KEY, json!("room1")))
        .await
        .unwrap();

    let remote = remote(&hub, None);
    let mut events = remote.take_events().unwrap();
    remote.connect("abc123").await.unwrap();
    remote
        .wait_for_controller(Duration::from_secs(5))
        .await
        .unwrap();
    let address = remote.session().transport().local_address().unwrap();

    assert!(hub.drop_participant(&address));
    let mut reconnecting = 0;
    loop {
        match events.recv().await {
            Some(RemoteEvent::Reconnecting) => reconnecting += 1,
            Some(RemoteEvent::Reconnected) => break,
            Some(RemoteEvent::Unrecoverable { reason }) => panic!("gave up: {reason}"),
            Some(_) => continue,
            None => panic!("remote event stream closed"),
        }
    }
    assert_eq!(reconnecting, 1);
    assert_eq!(hub.connect_count(), 3);

    remote
        .send_command("setVideoMute", &json!({"mute": false}))
        .await
        .unwrap();
    let command = next_command(&mut tv_events).await;
    assert_eq!(command.command_type, "setVideoMute");
}

#[test_timeout::tokio_timeout_test]
async fn commands_and_status_use_peer_link_once_open() {
    let hub = MemoryHub::new();
    let network = LoopbackNetwork::new();
    let tv = tv(&hub, Some(Arc::new(network.clone())));
    let mut tv_events = tv.take_events().unwrap();
    tv.join(Some(ChannelIdentity::new("abc", "123"))).await.unwrap();
    tv.publish_status(status(IN_MEETING_KEY, json!("room1")))
        .await
        .unwrap();

    let remote = remote(&hub, Some(Arc::new(network.clone())));
    let mut events = remote.take_events().unwrap();
    remote.connect("abc123").await.unwrap();
    let controller = remote
        .wait_for_controller(Duration::from_secs(5))
        .await
        .unwrap();

    loop {
        match events.recv().await {
            Some(RemoteEvent::PeerReady { address, ready: true }) => {
                assert_eq!(address, controller);
                break;
            }
            Some(_) => continue,
            None => panic!("remote event stream closed"),
        }
    }
    assert_eq!(network.open_links(), 1);

    remote
        .send_command(SET_AUDIO_MUTE, &json!({"mute": true}))
        .await
        .unwrap();
    let command = next_command(&mut tv_events).await;
    assert_eq!(command.route, CommandRoute::Peer);
    assert_eq!(command.data, json!({"mute": true}));

    tv.publish_status(status("audioMuted", json!(true)))
        .await
        .unwrap();
    let seen = wait_for_status(&mut events, "audioMuted", &json!(true)).await;
    assert_eq!(seen.get(IN_MEETING_KEY), Some(&json!("room1")));

    network.sever_all();
    loop {
        match events.recv().await {
            Some(RemoteEvent::PeerReady { ready: false, .. }) => break,
            Some(_) => continue,
            None => panic!("remote event stream closed"),
        }
    }
    remote
        .send_command("setTileView", &json!({"enabled": true}))
        .await
        .unwrap();
    let command = next_command(&mut tv_events).await;
    assert_eq!(command.command_type, "setTileView");
    assert_eq!(command.route, CommandRoute::Channel);
}
