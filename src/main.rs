use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{LevelFilter, error};
use tokio::signal::unix::{SignalKind, signal};

mod config;
mod engine;
mod filter;
mod hass;
mod messages;
mod ubus;
mod watcher;

#[cfg(test)]
mod testing;

/// Wi-Fi presence detector for Home Assistant
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/config/presence-detector.toml")]
    config: PathBuf,

    /// Log every state transition and API exchange
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::AppConfig::load(&args.config)?;

    let level = if args.debug || config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    pretty_env_logger::formatted_timed_builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = Arc::new(config);
    let sink = Arc::new(hass::HassClient::new(config.clone())?);
    let core = engine::Engine::new(config, sink, Arc::new(ubus::UbusCli::new()));

    let handle = core.handle();
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            error!("Unable to listen for shutdown signals: {:?}", err);
            return;
        }
        handle.stop();
    });

    core.run().await;

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
