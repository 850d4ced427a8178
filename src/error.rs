use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No local capture source could be acquired.
    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    /// A session description was rejected or could not be produced.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A message arrived that the receiver's protocol state cannot accept.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The task on the other end of a channel has gone away.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
