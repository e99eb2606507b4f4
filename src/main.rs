use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lobby_relay::config::Config;
use lobby_relay::signaling::SignalingServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::parse();

    let server = SignalingServer::bind(&config).await?;
    let addr = server.local_addr()?;

    println!("   Lobby Relay");
    println!("   WebSocket on ws://{}/server", addr);
    println!("   Press Ctrl+C to stop\n");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    Ok(())
}
