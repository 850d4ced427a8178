//! Room membership registry.
//!
//! Tracks the participants currently in the room in join order, together
//! with the record of the active participant. The active record is set once,
//! for the first participant to join a fresh registry, and is never moved to
//! anyone else; when that participant leaves, nobody present is active.

use serde::{Deserialize, Serialize};

/// Opaque identifier assigned by the transport when a connection opens.
pub type ConnectionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

#[derive(Debug, Default)]
pub struct Registry {
    participants: Vec<Participant>,
    active: Option<Participant>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a participant and returns its index. Duplicate display names
    /// are accepted.
    pub fn insert(&mut self, participant: Participant) -> usize {
        self.participants.push(participant);
        self.participants.len() - 1
    }

    pub fn lookup(&self, connection_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    /// Removes the first participant holding `connection_id`. The active
    /// record is left untouched even when it belongs to the removed entry.
    pub fn remove(&mut self, connection_id: &str) -> Option<(usize, Participant)> {
        let index = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        Some((index, self.participants.remove(index)))
    }

    /// Marks the participant at `index` as active. Out-of-range indices are
    /// ignored.
    pub fn assign_active(&mut self, index: usize) -> Option<&Participant> {
        let participant = self.participants.get(index)?.clone();
        self.active = Some(participant);
        self.active.as_ref()
    }

    /// The active record, which may refer to a participant that has left.
    pub fn active(&self) -> Option<&Participant> {
        self.active.as_ref()
    }

    pub fn is_active(&self, connection_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.connection_id == connection_id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.active = None;
    }
}
