//! Mesh voice room: a signaling relay plus the per-participant link logic
//! that negotiates a direct audio connection with every other participant.
//!
//! Server side: [`registry`], [`relay`], [`server`].
//! Client side: [`coordinator`], [`peer`], [`session`], [`webrtc`], [`media`].

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use error::{Error, Result};
