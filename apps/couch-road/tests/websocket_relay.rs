use couch_core::channel::{
    ChannelEvent, ChannelTransport, PresenceKind, RequestPayload, ResponseBody, WebSocketConnector,
};
use couch_core::{ChannelError, ChannelIdentity, CoreConfig, JoinOptions, StatusMap};
use couch_road::{router, Relay};
use serde_json::json;
use std::sync::Arc;

async fn start_relay() -> (String, Arc<Relay>) {
    let relay = Arc::new(Relay::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(relay.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), relay)
}

fn transport(url: &str) -> (ChannelTransport, tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>) {
    let connector = WebSocketConnector::new(url).unwrap();
    ChannelTransport::new(Arc::new(connector), &CoreConfig::default())
}

#[test_timeout::tokio_timeout_test]
async fn participants_exchange_presence_and_requests_over_websocket() {
    let (url, relay) = start_relay().await;
    let identity = ChannelIdentity::new("abc", "123");

    let (tv, mut tv_events) = transport(&url);
    tv.join(&identity, &JoinOptions::controller()).await.unwrap();
    tv.publish_status(StatusMap::from_iter([(
        "inMeeting".to_string(),
        json!("room1"),
    )]))
    .unwrap();

    let (remote, mut remote_events) = transport(&url);
    remote.join(&identity, &JoinOptions::remote()).await.unwrap();
    let tv_address = tv.local_address().unwrap();

    loop {
        match remote_events.recv().await {
            Some(ChannelEvent::Presence(change)) if change.from == tv_address => {
                assert_ne!(change.kind, PresenceKind::Left);
                if change.state.get("inMeeting") == Some(&json!("room1")) {
                    break;
                }
            }
            Some(_) => continue,
            None => panic!("remote events closed"),
        }
    }

    let responder = tokio::spawn(async move {
        while let Some(event) = tv_events.recv().await {
            if let ChannelEvent::Request(request) = event {
                tv.respond(
                    &request.from,
                    &request.id,
                    ResponseBody::Ok {
                        data: json!({"echo": true}),
                    },
                )
                .unwrap();
                return tv;
            }
        }
        panic!("tv events closed");
    });

    let response = remote
        .send_request(
            &tv_address,
            RequestPayload::Command {
                command_type: "setAudioMute".into(),
                data: "{\"mute\":true}".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"echo": true}));
    let tv = responder.await.unwrap();

    assert_eq!(relay.members("abc").len(), 2);
    tv.leave().await;
    remote.leave().await;
}

#[test_timeout::tokio_timeout_test]
async fn wrong_secret_is_rejected_by_relay() {
    let (url, _relay) = start_relay().await;
    let (tv, _tv_events) = transport(&url);
    tv.join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
        .await
        .unwrap();

    let (remote, _remote_events) = transport(&url);
    let result = remote
        .join(&ChannelIdentity::new("abc", "999"), &JoinOptions::remote())
        .await;
    assert_eq!(result, Err(ChannelError::Unauthorized));
}
