mod config;
mod logging;
mod server;
mod websocket;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use roomcast_sfu::{LoopbackEngine, NotificationFanout, RoomRegistry, SignalingHandler};

use config::Config;
use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "Roomcast SFU signaling server", long_about = None)]
struct Args {
    /// Path to a YAML/TOML/JSON config file
    #[arg(short, long, env = "ROOMCAST_CONFIG_PATH")]
    config: Option<String>,
}

/// Resolve and load configuration
///
/// Search order:
/// 1. `--config` / `ROOMCAST_CONFIG_PATH`
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (container mount path)
/// 4. Environment variables only
fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .filter(|p| Path::new(p).exists())
        .map(str::to_string)
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    if let Some(path) = explicit {
        if config_path.as_deref() != Some(path) {
            eprintln!("Config file {path} not found, searching defaults");
        }
    }

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::load(Some(&path)).with_context(|| format!("Failed to load {path}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables only");
            Config::from_env().context("Failed to load config from environment")?
        }
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Roomcast starting...");
    info!(
        rooms_enabled = config.sfu.rooms_enabled,
        max_rooms = config.sfu.max_rooms,
        max_peers_per_room = config.sfu.max_peers_per_room,
        "SFU configured"
    );

    // 3. Media engine and signaling core
    let engine = Arc::new(LoopbackEngine::new(config.engine.clone()));
    info!(
        listen_ip = %config.engine.listen_ip,
        announced_ip = %config.engine.candidate_ip(),
        rtc_min_port = config.engine.rtc_min_port,
        rtc_max_port = config.engine.rtc_max_port,
        "Media engine ready"
    );

    let registry = Arc::new(RoomRegistry::new(Arc::new(config.sfu.clone())));
    let fanout = Arc::new(NotificationFanout::new(Arc::clone(&registry)));
    let handler = Arc::new(SignalingHandler::new(
        engine,
        registry,
        fanout,
        config.engine.clone(),
    ));

    // 4. HTTP server
    let state = AppState {
        handler,
        server: Arc::new(config.server.clone()),
    };
    let app = server::build_router(state);

    let address = config.http_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Signaling server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Roomcast stopped");
    Ok(())
}
