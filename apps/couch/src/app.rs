use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::{remote, tv};
use couch_core::channel::WebSocketConnector;
use couch_core::{CoreConfig, PeerConnector};
use directories::BaseDirs;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let connector = Arc::new(WebSocketConnector::new(&cli.relay_url)?);
    info!(target: "couch::cli", relay = %connector.url(), "using relay");
    let config = CoreConfig::from_env();
    let peers = peer_connector(cli.peer_links)?;

    match cli.command {
        Command::Tv(args) => {
            let state_file = match cli.state_file {
                Some(path) => path,
                None => default_state_file()?,
            };
            tv::run(connector, peers, config, state_file, args).await
        }
        Command::Remote(args) => remote::run(connector, peers, config, args).await,
    }
}

fn default_state_file() -> Result<PathBuf, CliError> {
    let base = BaseDirs::new().ok_or(CliError::NoHomeDirectory)?;
    Ok(base.home_dir().join(".couch").join("state.json"))
}

#[cfg(feature = "webrtc")]
fn peer_connector(enabled: bool) -> Result<Option<Arc<dyn PeerConnector>>, CliError> {
    use couch_core::peer::WebRtcPeerConnector;
    Ok(enabled.then(|| Arc::new(WebRtcPeerConnector) as Arc<dyn PeerConnector>))
}

#[cfg(not(feature = "webrtc"))]
fn peer_connector(enabled: bool) -> Result<Option<Arc<dyn PeerConnector>>, CliError> {
    if enabled {
        return Err(CliError::InvalidArgument(
            "--peer-links needs a build with the `webrtc` feature".into(),
        ));
    }
    Ok(None)
}

/// Splits a `<name> <json>` input line. A missing payload is `null`.
pub fn parse_line(line: &str) -> Result<Option<(String, Value)>, CliError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, payload) = match line.split_once(char::is_whitespace) {
        Some((name, payload)) => (name, payload.trim()),
        None => (line, ""),
    };
    let data = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload)
            .map_err(|err| CliError::InvalidArgument(format!("invalid JSON payload: {err}")))?
    };
    Ok(Some((name.to_string(), data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_command_lines() {
        assert_eq!(
            parse_line("setAudioMute {\"mute\": true}").unwrap(),
            Some(("setAudioMute".to_string(), json!({"mute": true})))
        );
        assert_eq!(
            parse_line("  hangUp  ").unwrap(),
            Some(("hangUp".to_string(), Value::Null))
        );
        assert_eq!(parse_line("   ").unwrap(), None);
        assert!(parse_line("setTileView {oops").is_err());
    }
}
