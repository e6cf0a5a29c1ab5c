mod app;
mod cli;
mod error;
mod remote;
mod telemetry;
mod tv;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    if let Err(err) = telemetry::init(&cli.logging.to_config()) {
        eprintln!("couch: {err}");
        std::process::exit(1);
    }
    if let Err(err) = app::run(cli).await {
        eprintln!("couch: {err}");
        std::process::exit(1);
    }
}
