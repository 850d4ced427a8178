//! Relay and client configuration.
//!
//! Configuration is loaded from environment variables. `from_vars` takes an
//! explicit map so tests do not have to touch the process environment.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Port the relay listens on when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 3000;

/// Default relay bind host.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Identifier of the single room every participant joins.
pub const DEFAULT_ROOM_ID: &str = "abc-def";

/// Default signaling endpoint for the client.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3000";

/// Default STUN server used to gather reflexive candidates.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: SocketAddr,
    pub room_id: String,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = match vars.get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| ConfigError::InvalidValue(format!("PORT={raw}: {e}")))?,
            None => DEFAULT_PORT,
        };

        let host = vars
            .get("VOICE_ROOM_BIND_HOST")
            .map(String::as_str)
            .unwrap_or(DEFAULT_BIND_HOST);

        let bind_address = format!("{host}:{port}").parse().map_err(|e| {
            ConfigError::InvalidValue(format!("VOICE_ROOM_BIND_HOST={host}: {e}"))
        })?;

        let room_id = vars
            .get("VOICE_ROOM_ID")
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_ROOM_ID.to_string());

        Ok(Self {
            bind_address,
            room_id,
        })
    }
}

/// One ICE server entry. STUN entries carry empty credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Headless participant configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub display_name: String,
    /// Ogg/Opus file played as the local microphone. `None` means the
    /// participant has no capture source.
    pub audio_file: Option<PathBuf>,
    pub ice_servers: Vec<IceServer>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let display_name = vars
            .get("VOICE_ROOM_DISPLAY_NAME")
            .map(|name| name.trim().to_string())
            .ok_or_else(|| ConfigError::MissingEnvVar("VOICE_ROOM_DISPLAY_NAME".to_string()))?;
        if display_name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "VOICE_ROOM_DISPLAY_NAME must not be empty".to_string(),
            ));
        }

        let signaling_url = vars
            .get("VOICE_ROOM_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        if !signaling_url.starts_with("ws://") && !signaling_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(format!(
                "VOICE_ROOM_SIGNALING_URL must be a ws:// or wss:// URL, got {signaling_url}"
            )));
        }

        let audio_file = vars
            .get("VOICE_ROOM_AUDIO_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let stun_urls: Vec<String> = match vars.get("VOICE_ROOM_ICE_SERVERS") {
            Some(list) => split_urls(list),
            None => vec![DEFAULT_ICE_SERVER.to_string()],
        };
        let mut ice_servers = Vec::new();
        if !stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: stun_urls,
                ..Default::default()
            });
        }
        ice_servers.extend(turn_servers(vars)?);

        Ok(Self {
            signaling_url,
            display_name,
            audio_file,
            ice_servers,
        })
    }
}

fn split_urls(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}

/// Each `VOICE_ROOM_TURN_SERVERS` URL becomes its own entry sharing the
/// configured username and credential.
fn turn_servers(vars: &HashMap<String, String>) -> Result<Vec<IceServer>, ConfigError> {
    let urls = match vars.get("VOICE_ROOM_TURN_SERVERS") {
        Some(list) => split_urls(list),
        None => return Ok(Vec::new()),
    };
    if urls.is_empty() {
        return Ok(Vec::new());
    }

    let require = |key: &str| {
        vars.get(key)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    };
    let username = require("VOICE_ROOM_TURN_USERNAME")?;
    let credential = require("VOICE_ROOM_TURN_CREDENTIAL")?;

    urls.into_iter()
        .map(|url| {
            if url.starts_with("turn:") || url.starts_with("turns:") {
                Ok(IceServer {
                    urls: vec![url],
                    username: username.clone(),
                    credential: credential.clone(),
                })
            } else {
                Err(ConfigError::InvalidValue(format!(
                    "VOICE_ROOM_TURN_SERVERS entries must be turn: or turns: URLs, got {url}"
                )))
            }
        })
        .collect()
}
