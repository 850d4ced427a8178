//! WebSocket transport for the relay.
//!
//! Each accepted socket gets a reader loop (this task) and a writer task.
//! The reader decodes frames and hands them to the room; the writer drains
//! the connection's outbound channel. Neither waits on another connection.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::Result;
use crate::relay::RoomHandle;
use crate::signaling::{ClientMessage, RelayMessage};

/// Accepts connections until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    room: RoomHandle,
    cancel_token: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, room_id = %room.room_id(), "Relay listening");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Relay stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let room = room.clone();
                let span = tracing::info_span!("connection", peer_addr = %peer_addr);
                tokio::spawn(
                    async move {
                        if let Err(e) = handle_connection(stream, room).await {
                            debug!(error = %e, "Connection ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, room: RoomHandle) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayMessage>();
    let connection_id = room.connect(outbound.clone()).await?;
    debug!(connection_id = %connection_id, "WebSocket established");

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match msg.encode() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode relay message");
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    reject(&outbound, "binary frames must carry UTF-8 JSON");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Transport error");
                break;
            }
        };

        match ClientMessage::decode(&text) {
            Ok(message) => {
                if room.dispatch(&connection_id, message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Undecodable client message");
                reject(&outbound, &e.to_string());
            }
        }
    }

    // Implicit leave. The room drops its outbound sender, which ends the writer.
    let _ = room.disconnect(&connection_id).await;
    drop(outbound);
    let _ = writer.await;
    debug!(connection_id = %connection_id, "Connection closed");
    Ok(())
}

fn reject(outbound: &mpsc::UnboundedSender<RelayMessage>, reason: &str) {
    let _ = outbound.send(RelayMessage::Error {
        message: reason.to_string(),
    });
}
