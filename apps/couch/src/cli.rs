use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "couch",
    about = "Pair a TV with remotes over a couch-road relay",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "COUCH_RELAY_URL",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL of the couch-road relay"
    )]
    pub relay_url: String,

    #[arg(
        long,
        global = true,
        env = "COUCH_STATE_FILE",
        value_name = "PATH",
        help = "Where the TV keeps its reconnect hint (default ~/.couch/state.json)"
    )]
    pub state_file: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Negotiate direct WebRTC links (requires the `webrtc` feature)"
    )]
    pub peer_links: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "COUCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "COUCH_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run as the TV: create (or resume) a channel and print received commands
    Tv(TvArgs),
    /// Run as a remote: pair with a join code and send commands from stdin
    Remote(RemoteArgs),
}

#[derive(Args, Debug, Default)]
pub struct TvArgs {
    /// Join this 6-character code instead of generating one
    #[arg(long, value_name = "CODE")]
    pub code: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// The 6-character code shown by the TV
    pub code: String,

    /// Seconds to wait for the TV to appear in the channel
    #[arg(long, default_value_t = 10)]
    pub controller_timeout: u64,
}
