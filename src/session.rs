//! Boundary between link negotiation and the media stack.
//!
//! A `SessionEngine` performs the offer/answer/candidate primitives for one
//! remote participant. Things the engine discovers on its own (gathered
//! candidates, inbound media, a dead transport) come back as `EngineEvent`s
//! on the channel it was created with.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::Result;

#[async_trait]
pub trait SessionEngine: Send + Sync + 'static {
    /// Generates an offer, applies it as the local description and starts
    /// candidate gathering. Returns the serialized description.
    async fn create_offer(&self) -> Result<String>;

    /// Generates an answer for the applied remote offer and applies it as
    /// the local description. Returns the serialized description.
    async fn create_answer(&self) -> Result<String>;

    async fn apply_remote_description(&self, description: &str) -> Result<()>;

    /// Only valid once a remote description has been applied.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;

    /// Drops the local track subscription and tears the session down.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: SessionEngine;

    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self::Engine>;
}

#[derive(Debug)]
pub enum EngineEvent {
    /// A locally gathered candidate, serialized for the remote side.
    LocalCandidate(String),
    /// First inbound media from the remote participant.
    RemoteMedia(RemoteMedia),
    /// The underlying transport gave up.
    ConnectionFailed(String),
    /// Progress worth showing the user, such as ICE gathering state.
    Diagnostic(String),
}

/// Inbound media stream plus whatever is playing it out.
#[derive(Debug)]
pub struct RemoteMedia {
    stream_id: String,
    playback: Option<AbortHandle>,
}

impl RemoteMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            playback: None,
        }
    }

    pub fn with_playback(stream_id: impl Into<String>, playback: AbortHandle) -> Self {
        Self {
            stream_id: stream_id.into(),
            playback: Some(playback),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Stops playback. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(playback) = self.playback.take() {
            playback.abort();
        }
    }
}

impl Drop for RemoteMedia {
    fn drop(&mut self) {
        self.release();
    }
}
