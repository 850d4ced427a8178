use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Negotiation state of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }

    /// Whether the remote description has been applied in this state.
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            LinkState::OfferReceived
                | LinkState::AnswerSent
                | LinkState::AnswerReceived
                | LinkState::Connected
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::OfferSent => write!(f, "OfferSent"),
            LinkState::OfferReceived => write!(f, "OfferReceived"),
            LinkState::AnswerSent => write!(f, "AnswerSent"),
            LinkState::AnswerReceived => write!(f, "AnswerReceived"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Closed => write!(f, "Closed"),
            LinkState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub last_error: Option<String>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            last_error: None,
        }
    }
}

/// Observable status of a link, shared between the link task and whoever
/// wants to watch it.
#[derive(Clone)]
pub struct LinkMonitor {
    status: Arc<watch::Sender<LinkStatus>>,
    receiver: watch::Receiver<LinkStatus>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(LinkStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: LinkState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.state = LinkState::Failed;
        });
    }

    pub fn state(&self) -> LinkState {
        self.receiver.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.receiver.clone()
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
