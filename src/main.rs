//! Dots and Boxes Server
//!
//! Lobby and game server for two-player Dots and Boxes.
//! Configuration comes from `DOTS_*` environment variables, log filtering
//! from `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dots_boxes::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    info!("Dots and Boxes Server v{}", VERSION);
    info!(
        bind = %config.bind_addr,
        board_px = config.board_px,
        enforce_turns = config.enforce_turns,
        challenge_timeout = ?config.challenge_timeout,
        "Configuration loaded"
    );

    let server = Arc::new(GameServer::new(config).context("failed to initialise server")?);

    let runner = server.clone();
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serve => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            server.shutdown();
            serve.await.context("server task panicked")??;
        }
    }

    Ok(())
}
