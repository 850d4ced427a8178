//! Owns every peer link a participant has and routes relay traffic to them.
//!
//! There is at most one link per remote participant. Routing never waits on
//! a link: commands are queued on the link's own task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{LinkMonitor, LinkState};
use crate::peer::{LinkCommand, PeerLinkHandle};
use crate::registry::{ConnectionId, Participant};
use crate::session::EngineFactory;
use crate::signaling::{ClientMessage, RelayMessage, SignalingClient};

/// Something worth showing the user in the room's text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined {
        participant: Participant,
        is_active: bool,
    },
    ParticipantJoined {
        participant: Participant,
        is_active: bool,
    },
    Connected {
        remote_id: ConnectionId,
        display_name: Option<String>,
    },
    ParticipantLeft {
        remote_id: ConnectionId,
        display_name: Option<String>,
    },
    Chat {
        sender_display_name: String,
        text: String,
    },
    LinkFailed {
        remote_id: ConnectionId,
        reason: String,
    },
    Diagnostic {
        remote_id: Option<ConnectionId>,
        message: String,
    },
    Degraded {
        reason: String,
    },
    RelayError {
        message: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined {
                participant,
                is_active,
            } => {
                write!(f, "[System] Joined as {}", participant.display_name)?;
                if *is_active {
                    write!(f, " (active)")?;
                }
                Ok(())
            }
            Notice::ParticipantJoined { participant, .. } => {
                write!(f, "[System] {} joined", participant.display_name)
            }
            Notice::Connected {
                remote_id,
                display_name,
            } => write!(
                f,
                "[System] {} Connected!",
                display_name.as_deref().unwrap_or(remote_id)
            ),
            Notice::ParticipantLeft {
                remote_id,
                display_name,
            } => write!(
                f,
                "[System] {} disconnected",
                display_name.as_deref().unwrap_or(remote_id)
            ),
            Notice::Chat {
                sender_display_name,
                text,
            } => write!(f, "[{sender_display_name}] {text}"),
            Notice::LinkFailed { remote_id, reason } => {
                write!(f, "[System] Link to {remote_id} failed: {reason}")
            }
            Notice::Diagnostic {
                remote_id: Some(remote_id),
                message,
            } => write!(f, "[System] {remote_id}: {message}"),
            Notice::Diagnostic {
                remote_id: None,
                message,
            } => write!(f, "[System] {message}"),
            Notice::Degraded { reason } => {
                write!(f, "[System] Microphone unavailable, audio disabled: {reason}")
            }
            Notice::RelayError { message } => write!(f, "[System] Relay error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Full,
    /// No local media source; links are never created.
    Degraded { reason: String },
}

pub struct Coordinator<F: EngineFactory> {
    factory: Option<Arc<F>>,
    capability: Capability,
    identity: Option<Participant>,
    /// Display names learned from relay traffic.
    names: HashMap<ConnectionId, String>,
    links: HashMap<ConnectionId, PeerLinkHandle>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    notices: mpsc::UnboundedSender<Notice>,
    failures_tx: mpsc::UnboundedSender<ConnectionId>,
    failures_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl<F: EngineFactory> Coordinator<F> {
    pub fn new(
        factory: Arc<F>,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self::build(Some(factory), Capability::Full, outbox, notices)
    }

    /// A coordinator for a participant whose local media could not be
    /// acquired. The condition is reported once and never retried.
    pub fn degraded(
        reason: impl Into<String>,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        let reason = reason.into();
        warn!(reason = %reason, "Local media unavailable, running without peer links");
        let _ = notices.send(Notice::Degraded {
            reason: reason.clone(),
        });
        Self::build(None, Capability::Degraded { reason }, outbox, notices)
    }

    fn build(
        factory: Option<Arc<F>>,
        capability: Capability,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            capability,
            identity: None,
            names: HashMap::new(),
            links: HashMap::new(),
            outbox,
            notices,
            failures_tx,
            failures_rx,
        }
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn identity(&self) -> Option<&Participant> {
        self.identity.as_ref()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn has_link(&self, remote_id: &str) -> bool {
        self.links.contains_key(remote_id)
    }

    pub fn link_state(&self, remote_id: &str) -> Option<LinkState> {
        self.links.get(remote_id).map(PeerLinkHandle::state)
    }

    pub fn link_monitor(&self, remote_id: &str) -> Option<LinkMonitor> {
        self.links.get(remote_id).map(|link| link.monitor().clone())
    }

    pub fn handle_relay_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::JoinedSelf {
                participant,
                is_active_participant,
                roster,
            } => {
                info!(
                    connection_id = %participant.connection_id,
                    present = roster.len(),
                    "Joined room"
                );
                for entry in roster {
                    self.remember(&entry.participant);
                }
                self.identity = Some(participant.clone());
                self.notify(Notice::Joined {
                    participant,
                    is_active: is_active_participant,
                });
            }
            RelayMessage::ParticipantJoined {
                participant,
                is_active_participant,
            } => {
                let remote_id = participant.connection_id.clone();
                self.remember(&participant);
                self.notify(Notice::ParticipantJoined {
                    participant,
                    is_active: is_active_participant,
                });
                // We saw them arrive, so we make the call.
                if let Some(link) = self.ensure_link(&remote_id) {
                    link.send(LinkCommand::Initiate);
                }
            }
            RelayMessage::IncomingCall {
                caller_id,
                caller_name,
                offer,
            } => {
                debug!(caller_id = %caller_id, caller_name = ?caller_name, "Incoming call");
                if let Some(name) = caller_name {
                    self.names.insert(caller_id.clone(), name);
                }
                if let Some(link) = self.ensure_link(&caller_id) {
                    link.send(LinkCommand::Offer(offer));
                }
            }
            RelayMessage::IncomingAnswer {
                responder_id,
                answer,
            } => match self.links.get(&responder_id) {
                Some(link) => link.send(LinkCommand::Answer(answer)),
                None => self.notify(Notice::Diagnostic {
                    remote_id: Some(responder_id),
                    message: "answer for unknown call dropped".to_string(),
                }),
            },
            RelayMessage::RemoteCandidate {
                sender_id,
                candidate,
            } => match self.links.get(&sender_id) {
                Some(link) => link.send(LinkCommand::RemoteCandidate(candidate)),
                None => {
                    debug!(sender_id = %sender_id, "Candidate without a session dropped");
                    self.notify(Notice::Diagnostic {
                        remote_id: Some(sender_id),
                        message: "network candidate without a session dropped".to_string(),
                    });
                }
            },
            RelayMessage::Chat {
                sender_display_name,
                text,
            } => self.notify(Notice::Chat {
                sender_display_name,
                text,
            }),
            RelayMessage::ParticipantLeft { connection_id } => {
                if let Some(link) = self.links.remove(&connection_id) {
                    info!(remote_id = %connection_id, state = %link.state(), "Closing link to departed participant");
                    link.close();
                }
                let display_name = self.names.remove(&connection_id);
                self.notify(Notice::ParticipantLeft {
                    remote_id: connection_id,
                    display_name,
                });
            }
            RelayMessage::Error { message } => {
                warn!(error = %message, "Relay rejected a message");
                self.notify(Notice::RelayError { message });
            }
        }
    }

    /// Drops a link that reported an unrecoverable failure.
    pub fn handle_link_failure(&mut self, remote_id: &str) {
        let failed = self
            .links
            .get(remote_id)
            .is_some_and(|link| link.state() == LinkState::Failed);
        if failed {
            if let Some(link) = self.links.remove(remote_id) {
                debug!(remote_id = %remote_id, "Removing failed link");
                link.close();
            }
        }
    }

    /// Next failure report from a link task.
    pub async fn next_failure(&mut self) -> Option<ConnectionId> {
        self.failures_rx.recv().await
    }

    /// Processes relay traffic until the connection ends.
    pub async fn run(&mut self, signaling: &mut SignalingClient) {
        loop {
            tokio::select! {
                message = signaling.receive() => match message {
                    Some(message) => self.handle_relay_message(message),
                    None => {
                        info!("Signaling connection closed");
                        break;
                    }
                },
                Some(remote_id) = self.failures_rx.recv() => self.handle_link_failure(&remote_id),
            }
        }
    }

    /// Closes every link and waits for their resources to be released.
    pub async fn shutdown(&mut self) {
        let links: Vec<_> = self.links.drain().map(|(_, link)| link).collect();
        futures::future::join_all(links.into_iter().map(PeerLinkHandle::shutdown)).await;
    }

    fn ensure_link(&mut self, remote_id: &str) -> Option<&PeerLinkHandle> {
        let Some(factory) = self.factory.as_ref() else {
            debug!(remote_id = %remote_id, "No local media, not creating a link");
            return None;
        };
        if self.identity.as_ref().is_some_and(|me| me.connection_id == remote_id) {
            return None;
        }
        let link = self.links.entry(remote_id.to_string()).or_insert_with(|| {
            debug!(remote_id = %remote_id, "Creating peer link");
            PeerLinkHandle::spawn(
                remote_id.to_string(),
                self.names.get(remote_id).cloned(),
                Arc::clone(factory),
                self.outbox.clone(),
                self.notices.clone(),
                self.failures_tx.clone(),
            )
        });
        Some(link)
    }

    fn remember(&mut self, participant: &Participant) {
        self.names.insert(
            participant.connection_id.clone(),
            participant.display_name.clone(),
        );
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}
