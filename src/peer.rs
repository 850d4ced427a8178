//! Negotiation state machine for the link to one remote participant.
//!
//! The side that sees the other join sends the offer; the side that was
//! already in the room answers. Remote candidates that arrive before a remote
//! description exists are held back and replayed, in arrival order, as soon
//! as one is applied. Local candidates go out immediately.
//!
//! A failure on one link is reported as a notice and never touches any other
//! link.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::connection::{LinkMonitor, LinkState};
use crate::coordinator::Notice;
use crate::error::Error;
use crate::registry::ConnectionId;
use crate::session::{EngineEvent, EngineFactory, RemoteMedia, SessionEngine};
use crate::signaling::ClientMessage;

pub struct PeerLink<E: SessionEngine> {
    remote_id: ConnectionId,
    display_name: Option<String>,
    engine: E,
    monitor: LinkMonitor,
    pending_candidates: VecDeque<String>,
    remote_media: Option<RemoteMedia>,
    released: bool,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<E: SessionEngine> PeerLink<E> {
    pub fn new(
        remote_id: ConnectionId,
        engine: E,
        monitor: LinkMonitor,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            remote_id,
            display_name: None,
            engine,
            monitor,
            pending_candidates: VecDeque::new(),
            remote_media: None,
            released: false,
            outbox,
            notices,
        }
    }

    /// Name used for this remote in user-facing notices.
    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name;
        self
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> LinkState {
        self.monitor.state()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    /// Start the handshake from our side.
    pub async fn initiate(&mut self) {
        if !self.expect_state(LinkState::Idle, "initiate") {
            return;
        }
        match self.engine.create_offer().await {
            Ok(offer) => {
                self.transition(LinkState::OfferSent);
                self.send(ClientMessage::CallOffer {
                    target_id: self.remote_id.clone(),
                    offer,
                });
            }
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn handle_offer(&mut self, offer: &str) {
        if !self.expect_state(LinkState::Idle, "offer") {
            return;
        }
        if let Err(e) = self.engine.apply_remote_description(offer).await {
            self.fail(e).await;
            return;
        }
        self.transition(LinkState::OfferReceived);
        self.replay_pending_candidates().await;

        match self.engine.create_answer().await {
            Ok(answer) => {
                self.transition(LinkState::AnswerSent);
                self.send(ClientMessage::CallAnswer {
                    caller_id: self.remote_id.clone(),
                    answer,
                });
            }
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn handle_answer(&mut self, answer: &str) {
        if !self.expect_state(LinkState::OfferSent, "answer") {
            return;
        }
        if let Err(e) = self.engine.apply_remote_description(answer).await {
            self.fail(e).await;
            return;
        }
        self.transition(LinkState::AnswerReceived);
        self.replay_pending_candidates().await;
    }

    pub async fn handle_remote_candidate(&mut self, candidate: String) {
        let state = self.state();
        if state.is_terminal() {
            debug!(remote_id = %self.remote_id, %state, "Candidate for finished link dropped");
        } else if state.has_remote_description() {
            self.apply_candidate(&candidate).await;
        } else {
            debug!(
                remote_id = %self.remote_id,
                queued = self.pending_candidates.len() + 1,
                "Remote description not applied yet, queueing candidate"
            );
            self.pending_candidates.push_back(candidate);
        }
    }

    /// Relays a locally gathered candidate straight away.
    pub fn handle_local_candidate(&mut self, candidate: String) {
        if self.state().is_terminal() {
            return;
        }
        self.send(ClientMessage::IceCandidate {
            target_id: self.remote_id.clone(),
            candidate,
        });
    }

    pub async fn handle_remote_media(&mut self, mut media: RemoteMedia) {
        match self.state() {
            LinkState::AnswerSent | LinkState::AnswerReceived => {
                info!(remote_id = %self.remote_id, stream_id = %media.stream_id(), "Remote media attached");
                self.remote_media = Some(media);
                self.transition(LinkState::Connected);
                let _ = self.notices.send(Notice::Connected {
                    remote_id: self.remote_id.clone(),
                    display_name: self.display_name.clone(),
                });
            }
            state => {
                debug!(remote_id = %self.remote_id, %state, "Ignoring extra remote media");
                media.release();
            }
        }
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => self.handle_local_candidate(candidate),
            EngineEvent::RemoteMedia(media) => self.handle_remote_media(media).await,
            EngineEvent::ConnectionFailed(reason) => {
                if !self.state().is_terminal() {
                    self.fail(Error::Negotiation(reason)).await;
                }
            }
            EngineEvent::Diagnostic(message) => {
                if !self.state().is_terminal() {
                    let _ = self.notices.send(Notice::Diagnostic {
                        remote_id: Some(self.remote_id.clone()),
                        message,
                    });
                }
            }
        }
    }

    /// Moves the link to `Closed` and releases its resources. Calling it on
    /// a finished link changes nothing; a failed link stays failed.
    pub async fn close(&mut self) -> LinkState {
        self.release().await;
        if !self.state().is_terminal() {
            self.transition(LinkState::Closed);
        }
        self.state()
    }

    async fn fail(&mut self, error: Error) {
        if self.state().is_terminal() {
            return;
        }
        let reason = error.to_string();
        warn!(remote_id = %self.remote_id, error = %reason, "Peer link failed");
        self.release().await;
        self.monitor.set_error(reason.clone());
        let _ = self.notices.send(Notice::LinkFailed {
            remote_id: self.remote_id.clone(),
            reason,
        });
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pending_candidates.clear();
        if let Some(mut media) = self.remote_media.take() {
            media.release();
        }
        if let Err(e) = self.engine.close().await {
            warn!(remote_id = %self.remote_id, error = %e, "Error while closing session");
        }
    }

    async fn replay_pending_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: &str) {
        if let Err(e) = self.engine.add_remote_candidate(candidate).await {
            warn!(remote_id = %self.remote_id, error = %e, "Remote candidate dropped");
            let _ = self.notices.send(Notice::Diagnostic {
                remote_id: Some(self.remote_id.clone()),
                message: format!("network candidate dropped: {e}"),
            });
        }
    }

    fn expect_state(&self, expected: LinkState, event: &str) -> bool {
        let state = self.state();
        if state == expected {
            return true;
        }
        warn!(remote_id = %self.remote_id, %state, event, "Ignoring out-of-order negotiation message");
        let _ = self.notices.send(Notice::Diagnostic {
            remote_id: Some(self.remote_id.clone()),
            message: format!("ignored {event} while {state}"),
        });
        false
    }

    fn transition(&self, next: LinkState) {
        debug!(remote_id = %self.remote_id, from = %self.state(), to = %next, "Link transition");
        self.monitor.update_state(next);
    }

    fn send(&self, message: ClientMessage) {
        if self.outbox.send(message).is_err() {
            debug!(remote_id = %self.remote_id, "Signaling outbox closed, message dropped");
        }
    }
}

#[derive(Debug)]
pub enum LinkCommand {
    Initiate,
    Offer(String),
    Answer(String),
    RemoteCandidate(String),
    Close,
}

/// Handle to a running link task.
pub struct PeerLinkHandle {
    remote_id: ConnectionId,
    sender: mpsc::UnboundedSender<LinkCommand>,
    monitor: LinkMonitor,
    task: JoinHandle<()>,
}

impl PeerLinkHandle {
    /// Spawns the link task. The session engine is created inside the task,
    /// so a slow or failing setup never holds up the caller.
    pub fn spawn<F: EngineFactory>(
        remote_id: ConnectionId,
        display_name: Option<String>,
        factory: Arc<F>,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<Notice>,
        failures: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let monitor = LinkMonitor::new();
        let span = tracing::debug_span!("peer_link", remote_id = %remote_id);

        let task_monitor = monitor.clone();
        let task_remote_id = remote_id.clone();
        let task = tokio::spawn(
            async move {
                let (events_tx, events) = mpsc::unbounded_channel();
                let engine = match factory.create(&task_remote_id, events_tx).await {
                    Ok(engine) => engine,
                    Err(e) => {
                        warn!(error = %e, "Could not create session");
                        task_monitor.set_error(e.to_string());
                        let _ = notices.send(Notice::LinkFailed {
                            remote_id: task_remote_id.clone(),
                            reason: e.to_string(),
                        });
                        let _ = failures.send(task_remote_id);
                        return;
                    }
                };
                let link = PeerLink::new(task_remote_id, engine, task_monitor, outbox, notices)
                    .with_display_name(display_name);
                run_link(link, commands, events, failures).await;
            }
            .instrument(span),
        );

        Self {
            remote_id,
            sender,
            monitor,
            task,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> LinkState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    pub fn send(&self, command: LinkCommand) {
        if self.sender.send(command).is_err() {
            debug!(remote_id = %self.remote_id, "Link task already finished");
        }
    }

    /// Asks the task to close the link and returns without waiting.
    pub fn close(&self) {
        self.send(LinkCommand::Close);
    }

    /// Closes the link and waits for the task to release everything.
    pub async fn shutdown(self) {
        self.close();
        let _ = self.task.await;
    }
}

async fn run_link<E: SessionEngine>(
    mut link: PeerLink<E>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    failures: mpsc::UnboundedSender<ConnectionId>,
) {
    let mut failure_reported = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Initiate) => link.initiate().await,
                Some(LinkCommand::Offer(offer)) => link.handle_offer(&offer).await,
                Some(LinkCommand::Answer(answer)) => link.handle_answer(&answer).await,
                Some(LinkCommand::RemoteCandidate(candidate)) => {
                    link.handle_remote_candidate(candidate).await;
                }
                Some(LinkCommand::Close) | None => break,
            },
            Some(event) = events.recv() => link.handle_engine_event(event).await,
        }

        if link.state() == LinkState::Failed && !failure_reported {
            failure_reported = true;
            let _ = failures.send(link.remote_id().to_string());
        }
    }

    let state = link.close().await;
    debug!(%state, "Link task finished");
}
