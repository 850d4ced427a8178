//! In-memory session engine for exercising peer links without a network.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voice_room::connection::{LinkMonitor, LinkState};
use voice_room::session::{EngineEvent, EngineFactory, SessionEngine};
use voice_room::{Error, Result};

pub const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    ApplyRemote(String),
    AddCandidate(String),
    Close,
}

/// How a fake engine behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_offer: bool,
    pub reject_remote: bool,
    pub reject_candidates: Vec<String>,
    /// Local candidates "gathered" once a local description is set.
    pub gathered: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct MockEngine {
    remote_id: String,
    script: Script,
    recorder: Recorder,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl MockEngine {
    pub fn new(
        remote_id: &str,
        script: Script,
    ) -> (Self, Recorder, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let recorder = Recorder::default();
        let engine = Self {
            remote_id: remote_id.to_string(),
            script,
            recorder: recorder.clone(),
            events,
        };
        (engine, recorder, events_rx)
    }

    fn gather(&self) {
        for candidate in &self.script.gathered {
            let _ = self
                .events
                .send(EngineEvent::LocalCandidate(candidate.clone()));
        }
    }
}

#[async_trait]
impl SessionEngine for MockEngine {
    async fn create_offer(&self) -> Result<String> {
        self.recorder.push(Call::CreateOffer);
        if self.script.fail_offer {
            return Err(Error::Negotiation("offer could not be generated".to_string()));
        }
        self.gather();
        Ok(format!("offer-to-{}", self.remote_id))
    }

    async fn create_answer(&self) -> Result<String> {
        self.recorder.push(Call::CreateAnswer);
        self.gather();
        Ok(format!("answer-to-{}", self.remote_id))
    }

    async fn apply_remote_description(&self, description: &str) -> Result<()> {
        self.recorder.push(Call::ApplyRemote(description.to_string()));
        if self.script.reject_remote {
            return Err(Error::Negotiation("description rejected".to_string()));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        self.recorder.push(Call::AddCandidate(candidate.to_string()));
        if self.script.reject_candidates.iter().any(|c| c == candidate) {
            return Err(Error::Protocol("malformed candidate".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.recorder.push(Call::Close);
        Ok(())
    }
}

/// Hands out scripted engines and remembers them by remote id.
#[derive(Default)]
pub struct MockFactory {
    scripts: HashMap<String, Script>,
    default_script: Script,
    fail_create: bool,
    engines: Mutex<HashMap<String, (Recorder, mpsc::UnboundedSender<EngineEvent>)>>,
}

impl MockFactory {
    pub fn new(default_script: Script) -> Self {
        Self {
            default_script,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }

    pub fn with_script(mut self, remote_id: &str, script: Script) -> Self {
        self.scripts.insert(remote_id.to_string(), script);
        self
    }

    pub fn created(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    pub fn recorder(&self, remote_id: &str) -> Option<Recorder> {
        self.engines
            .lock()
            .unwrap()
            .get(remote_id)
            .map(|(recorder, _)| recorder.clone())
    }

    /// Pretends the engine for `remote_id` produced `event`.
    pub fn emit(&self, remote_id: &str, event: EngineEvent) -> bool {
        self.engines
            .lock()
            .unwrap()
            .get(remote_id)
            .is_some_and(|(_, events)| events.send(event).is_ok())
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    type Engine = MockEngine;

    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<MockEngine> {
        if self.fail_create {
            return Err(Error::Negotiation("session setup failed".to_string()));
        }
        let recorder = Recorder::default();
        let script = self
            .scripts
            .get(remote_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        self.engines
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), (recorder.clone(), events.clone()));
        Ok(MockEngine {
            remote_id: remote_id.to_string(),
            script,
            recorder,
            events,
        })
    }
}

pub async fn wait_for_state(monitor: &LinkMonitor, state: LinkState) {
    let mut rx = monitor.subscribe();
    tokio::time::timeout(TIMEOUT, rx.wait_for(|status| status.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, link is {}", monitor.state()))
        .expect("link monitor closed");
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}
