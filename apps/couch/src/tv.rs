use crate::app::parse_line;
use crate::cli::TvArgs;
use crate::error::CliError;
use couch_core::channel::WebSocketConnector;
use couch_core::{
    ControllerEvent, ControllerRole, CoreConfig, FileStore, PeerConnector, StatusMap,
    exchange_code,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Runs the TV until ctrl-c or end of input. Input lines `<key> <json>`
/// are published as status.
pub async fn run(
    connector: Arc<WebSocketConnector>,
    peers: Option<Arc<dyn PeerConnector>>,
    config: CoreConfig,
    state_file: PathBuf,
    args: TvArgs,
) -> Result<(), CliError> {
    let identity = args.code.as_deref().map(exchange_code).transpose()?;
    let store = Arc::new(FileStore::new(state_file));
    let controller = ControllerRole::new(connector, peers, store, config);
    let mut events = controller
        .take_events()
        .ok_or_else(|| CliError::InvalidArgument("controller events already taken".into()))?;

    controller.join(identity).await?;
    if let Some(code) = controller.join_code() {
        println!("join code: {code}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
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
            line = lines.next_line(), if input_open => match line? {
                Some(line) => match parse_line(&line) {
                    Ok(Some((key, value))) => {
                        let partial = StatusMap::from_iter([(key, value)]);
                        if let Err(err) = controller.publish_status(partial).await {
                            warn!(target: "couch::cli", error = %err, "publish failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                },
                None => input_open = false,
            },
        }
    }

    controller.leave().await;
    Ok(())
}

/// Returns false once the session is over.
fn print_event(event: ControllerEvent) -> bool {
    match event {
        ControllerEvent::Joined { .. } => {}
        ControllerEvent::JoinCodeChanged { join_code } => println!("join code: {join_code}"),
        ControllerEvent::RemoteJoined { address } => println!("remote joined: {address}"),
        ControllerEvent::RemoteLeft { address } => println!("left: {address}"),
        ControllerEvent::Command(command) => {
            println!(
                "command from {}: {} {}",
                command.from, command.command_type, command.data
            );
        }
        ControllerEvent::PeerReady { address, ready } => {
            println!("peer link to {address}: {}", if ready { "up" } else { "down" });
        }
        ControllerEvent::Reconnecting => println!("reconnecting"),
        ControllerEvent::Reconnected => println!("reconnected"),
        ControllerEvent::Unrecoverable { reason } => {
            println!("connection lost: {reason}");
            return false;
        }
    }
    true
}
