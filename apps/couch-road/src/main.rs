use clap::Parser;
use couch_road::{router, spawn_sweeper, Config, Relay};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "couch-road", about = "Channel relay for couch TVs and remotes")]
struct Cli {
    #[arg(long, env = "COUCH_ROAD_PORT", help = "Port to listen on")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let relay = Arc::new(Relay::new());
    spawn_sweeper(relay.clone(), config.sweep_interval, config.stale_timeout);
    let app = router(relay);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(target: "couch::road", addr = %addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(target: "couch::road", addr = %addr, "couch-road listening");

    if let Err(err) = axum::serve(listener, app).await {
        error!(target: "couch::road", error = %err, "server error");
        std::process::exit(1);
    }
}
