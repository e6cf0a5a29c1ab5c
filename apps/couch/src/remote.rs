use crate::app::parse_line;
use crate::cli::RemoteArgs;
use crate::error::CliError;
use couch_core::channel::WebSocketConnector;
use couch_core::{CoreConfig, PeerConnector, RemoteEvent, RemoteRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Pairs with the TV and sends every `<commandType> <json>` input line as a
/// command until ctrl-c, end of input or loss of the TV.
pub async fn run(
    connector: Arc<WebSocketConnector>,
    peers: Option<Arc<dyn PeerConnector>>,
    config: CoreConfig,
    args: RemoteArgs,
) -> Result<(), CliError> {
    let remote = RemoteRole::new(connector, peers, config);
    let mut events = remote
        .take_events()
        .ok_or_else(|| CliError::InvalidArgument("remote events already taken".into()))?;

    remote.connect(&args.code).await?;
    let controller = remote
        .wait_for_controller(Duration::from_secs(args.controller_timeout))
        .await?;
    println!("paired with {controller}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if !print_event(event) {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match parse_line(&line) {
                    Ok(Some((command_type, data))) => {
                        match remote.send_command(&command_type, &data).await {
                            Ok(response) => println!("{command_type}: ok {response}"),
                            Err(err) => println!("{command_type}: failed: {err}"),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                },
                None => break,
            },
        }
    }

    remote.disconnect().await;
    Ok(())
}

/// Returns false once the session is over.
fn print_event(event: RemoteEvent) -> bool {
    match event {
        RemoteEvent::ControllerFound { address } => println!("controller: {address}"),
        RemoteEvent::ControllerStatus { status } => {
            println!("status: {}", serde_json::Value::Object(status));
        }
        RemoteEvent::ControllerLost => {
            println!("the TV left the channel");
            return false;
        }
        RemoteEvent::PeerReady { address, ready } => {
            println!("peer link to {address}: {}", if ready { "up" } else { "down" });
        }
        RemoteEvent::Reconnecting => println!("reconnecting"),
        RemoteEvent::Reconnected => println!("reconnected"),
        RemoteEvent::Unrecoverable { reason } => {
            println!("connection lost: {reason}");
            return false;
        }
    }
    true
}
