//! Signaling relay for the single room.
//!
//! A `RoomActor` owns the membership registry and every piece of mutable
//! room state. Connection tasks talk to it through a `RoomHandle`; deliveries
//! to participants go out on unbounded per-connection channels so the actor
//! never waits on a slow receiver.
//!
//! Forwarded call setup messages are not checked against the registry. A
//! message for a connection that no longer exists is dropped without telling
//! the sender.

use std::collections::{HashMap, HashSet};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::registry::{ConnectionId, Participant, Registry};
use crate::signaling::{ClientMessage, RelayMessage, RosterEntry};

/// Mailbox size for the room actor.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Length of generated connection identifiers.
const CONNECTION_ID_LEN: usize = 20;

/// Delivery handle for one connection.
pub type Outbound = mpsc::UnboundedSender<RelayMessage>;

#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        connection_id: ConnectionId,
        outbound: Outbound,
    },
    Inbound {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Snapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },
}

/// Point-in-time view of the room.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<RosterEntry>,
    pub connections: usize,
}

impl RoomSnapshot {
    pub fn active_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.is_active_participant)
            .count()
    }
}

pub fn new_connection_id() -> ConnectionId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECTION_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomCommand>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Registers a new transport connection and returns its assigned id.
    pub async fn connect(&self, outbound: Outbound) -> Result<ConnectionId> {
        let connection_id = new_connection_id();
        self.send(RoomCommand::Connect {
            connection_id: connection_id.clone(),
            outbound,
        })
        .await?;
        Ok(connection_id)
    }

    pub async fn dispatch(&self, connection_id: &str, message: ClientMessage) -> Result<()> {
        self.send(RoomCommand::Inbound {
            connection_id: connection_id.to_string(),
            message,
        })
        .await
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        self.send(RoomCommand::Disconnect {
            connection_id: connection_id.to_string(),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| Error::ChannelClosed("room actor"))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, command: RoomCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed("room actor"))
    }
}

pub struct RoomActor {
    room_id: String,
    registry: Registry,
    connections: HashMap<ConnectionId, Outbound>,
    names: HashMap<ConnectionId, String>,
    members: HashSet<ConnectionId>,
    receiver: mpsc::Receiver<RoomCommand>,
    cancel_token: CancellationToken,
}

impl RoomActor {
    pub fn spawn(room_id: String, cancel_token: CancellationToken) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            registry: Registry::new(),
            connections: HashMap::new(),
            names: HashMap::new(),
            members: HashSet::new(),
            receiver,
            cancel_token: cancel_token.clone(),
        };

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, tokio::spawn(actor.run()))
    }

    #[instrument(skip_all, name = "room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!("Room opened");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        self.registry.clear();
        self.connections.clear();
        info!("Room closed");
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect {
                connection_id,
                outbound,
            } => {
                debug!(connection_id = %connection_id, "Connection opened");
                self.connections.insert(connection_id, outbound);
            }
            RoomCommand::Inbound {
                connection_id,
                message,
            } => self.handle_message(&connection_id, message),
            RoomCommand::Disconnect { connection_id } => self.handle_departure(&connection_id),
            RoomCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn handle_message(&mut self, sender: &str, message: ClientMessage) {
        match message {
            ClientMessage::Join { display_name } => self.handle_join(sender, display_name),
            ClientMessage::CallOffer { target_id, offer } => {
                let caller_name = self.names.get(sender).cloned();
                self.deliver(
                    &target_id,
                    RelayMessage::IncomingCall {
                        caller_id: sender.to_string(),
                        caller_name,
                        offer,
                    },
                );
            }
            ClientMessage::CallAnswer { caller_id, answer } => self.deliver(
                &caller_id,
                RelayMessage::IncomingAnswer {
                    responder_id: sender.to_string(),
                    answer,
                },
            ),
            ClientMessage::IceCandidate {
                target_id,
                candidate,
            } => self.deliver(
                &target_id,
                RelayMessage::RemoteCandidate {
                    sender_id: sender.to_string(),
                    candidate,
                },
            ),
            ClientMessage::Chat {
                sender_display_name,
                text,
            } => self.broadcast(
                sender,
                &RelayMessage::Chat {
                    sender_display_name,
                    text,
                },
            ),
        }
    }

    fn handle_join(&mut self, connection_id: &str, display_name: String) {
        // One registry entry per connection.
        if self.members.contains(connection_id) {
            debug!(connection_id = %connection_id, "Repeated join rejected");
            self.deliver(
                connection_id,
                RelayMessage::Error {
                    message: "already joined".to_string(),
                },
            );
            return;
        }

        let participant = Participant {
            connection_id: connection_id.to_string(),
            display_name: display_name.clone(),
        };

        self.names.insert(connection_id.to_string(), display_name);
        self.members.insert(connection_id.to_string());

        let roster = self.roster();
        let index = self.registry.insert(participant.clone());
        if self.registry.active().is_none() {
            self.registry.assign_active(index);
        }
        let is_active_participant = self.registry.is_active(connection_id);

        info!(
            connection_id = %connection_id,
            display_name = %participant.display_name,
            is_active = is_active_participant,
            participants = self.registry.len(),
            "Participant joined"
        );

        self.deliver(
            connection_id,
            RelayMessage::JoinedSelf {
                participant: participant.clone(),
                is_active_participant,
                roster,
            },
        );
        self.broadcast(
            connection_id,
            &RelayMessage::ParticipantJoined {
                participant,
                is_active_participant,
            },
        );
    }

    fn handle_departure(&mut self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.names.remove(connection_id);
        let was_member = self.members.remove(connection_id);

        match self.registry.remove(connection_id) {
            Some((index, participant)) => info!(
                connection_id = %connection_id,
                display_name = %participant.display_name,
                index,
                participants = self.registry.len(),
                "Participant left"
            ),
            None => debug!(connection_id = %connection_id, "Connection closed before joining"),
        }

        if was_member {
            self.broadcast(
                connection_id,
                &RelayMessage::ParticipantLeft {
                    connection_id: connection_id.to_string(),
                },
            );
        }
    }

    /// Fire-and-forget delivery to one connection.
    fn deliver(&self, target: &str, message: RelayMessage) {
        match self.connections.get(target) {
            Some(outbound) => {
                if outbound.send(message).is_err() {
                    debug!(target_id = %target, "Target connection is closing, message dropped");
                }
            }
            None => debug!(target_id = %target, "Unknown target, message dropped"),
        }
    }

    /// Delivers to every room member except `sender`.
    fn broadcast(&self, sender: &str, message: &RelayMessage) {
        for member in self.members.iter().filter(|m| m.as_str() != sender) {
            self.deliver(member, message.clone());
        }
    }

    fn roster(&self) -> Vec<RosterEntry> {
        self.registry
            .participants()
            .iter()
            .map(|p| RosterEntry {
                participant: p.clone(),
                is_active_participant: self.registry.is_active(&p.connection_id),
            })
            .collect()
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            participants: self.roster(),
            connections: self.connections.len(),
        }
    }
}
