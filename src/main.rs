//! Voice room relay.
//!
//! Accepts WebSocket connections, keeps the room's membership in memory and
//! forwards call setup messages between participants. Nothing survives a
//! restart.

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_room::config::RelayConfig;
use voice_room::relay::RoomActor;
use voice_room::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_room=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(
        bind_address = %config.bind_address,
        room_id = %config.room_id,
        "Configuration loaded"
    );

    let cancel_token = CancellationToken::new();
    let (room, room_task) = RoomActor::spawn(config.room_id.clone(), cancel_token.child_token());

    let listener = TcpListener::bind(config.bind_address).await?;
    info!(port = config.bind_address.port(), "UP And Running");

    let server_token = cancel_token.clone();
    let server_task = tokio::spawn(server::serve(listener, room, server_token));

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel_token.cancel();

    if let Err(e) = server_task.await? {
        error!(error = %e, "Relay server exited with error");
    }
    room_task.await?;
    info!("Relay stopped");
    Ok(())
}
