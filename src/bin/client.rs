//! Headless voice room participant.
//!
//! Joins the room, opens a peer link to every other participant, sends each
//! stdin line as a chat message and prints room notices to stdout.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_room::config::ClientConfig;
use voice_room::coordinator::{Coordinator, Notice};
use voice_room::media::LocalMedia;
use voice_room::signaling::{ClientMessage, SignalingClient};
use voice_room::webrtc::WebRtcFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_room=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let mut signaling = SignalingClient::connect(&config.signaling_url).await?;
    info!(url = %config.signaling_url, "Connected to relay");

    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel::<Notice>();
    tokio::spawn(async move {
        while let Some(notice) = notices_rx.recv().await {
            println!("{notice}");
        }
    });

    let factory = LocalMedia::acquire(&config)
        .and_then(|media| WebRtcFactory::new(media, &config.ice_servers));

    let mut coordinator = match factory {
        Ok(factory) => {
            let coordinator =
                Coordinator::new(Arc::new(factory), signaling.outbox(), notices_tx.clone());
            signaling.send(ClientMessage::Join {
                display_name: config.display_name.clone(),
            })?;
            coordinator
        }
        // Without a microphone we stay out of the room.
        Err(e) => Coordinator::degraded(e.to_string(), signaling.outbox(), notices_tx.clone()),
    };

    let outbox = signaling.outbox();
    let display_name = config.display_name.clone();
    let chat = async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = line.trim().to_string();
            if text.is_empty() {
                continue;
            }
            let _ = notices_tx.send(Notice::Chat {
                sender_display_name: display_name.clone(),
                text: text.clone(),
            });
            if outbox
                .send(ClientMessage::Chat {
                    sender_display_name: display_name.clone(),
                    text,
                })
                .is_err()
            {
                break;
            }
        }
        std::future::pending::<()>().await;
    };

    tokio::select! {
        () = coordinator.run(&mut signaling) => {}
        () = chat => {}
        result = signal::ctrl_c() => result?,
    }

    coordinator.shutdown().await;
    info!("Left the room");
    Ok(())
}
