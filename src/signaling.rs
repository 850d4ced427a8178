use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registry::{ConnectionId, Participant};

/// Messages a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        display_name: String,
    },
    CallOffer {
        target_id: ConnectionId,
        offer: String,
    },
    CallAnswer {
        caller_id: ConnectionId,
        answer: String,
    },
    IceCandidate {
        target_id: ConnectionId,
        candidate: String,
    },
    Chat {
        sender_display_name: String,
        text: String,
    },
}

/// A present participant as seen by a joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub participant: Participant,
    pub is_active_participant: bool,
}

/// Messages the relay delivers to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum RelayMessage {
    JoinedSelf {
        participant: Participant,
        is_active_participant: bool,
        #[serde(default)]
        roster: Vec<RosterEntry>,
    },
    ParticipantJoined {
        participant: Participant,
        is_active_participant: bool,
    },
    IncomingCall {
        caller_id: ConnectionId,
        caller_name: Option<String>,
        offer: String,
    },
    IncomingAnswer {
        responder_id: ConnectionId,
        answer: String,
    },
    RemoteCandidate {
        sender_id: ConnectionId,
        candidate: String,
    },
    Chat {
        sender_display_name: String,
        text: String,
    },
    ParticipantLeft {
        connection_id: ConnectionId,
    },
    Error {
        message: String,
    },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl RelayMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// WebSocket connection to the relay.
///
/// Outbound messages are queued on an unbounded channel drained by a writer
/// task, so handing a message to the client never waits on the network.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::Receiver<RelayMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match msg.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable signaling message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Signaling connection ended");
                        break;
                    }
                };
                match RelayMessage::decode(&text) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring undecodable relay message"),
                }
            }
        });

        Ok(Self {
            tx: outgoing_tx,
            rx,
        })
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::ChannelClosed("signaling writer"))
    }

    /// Sender half for components that emit messages on their own.
    pub fn outbox(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    /// Next relay message, or `None` once the connection is gone.
    pub async fn receive(&mut self) -> Option<RelayMessage> {
        self.rx.recv().await
    }
}
