//! Client configuration, loaded from TOML. Every field has a default so an empty
//! file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::media::MediaConstraints;

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY_MS: u64 = 1000;
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay: RelaySettings,
    pub rendezvous: RendezvousSettings,
    pub negotiation: NegotiationSettings,
    pub media: MediaConstraints,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub url: String,
    /// Handshake attempts per connect or reconnect before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_owned(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            max_reconnect_delay_ms: MAX_RECONNECT_DELAY_MS,
        }
    }
}

impl RelaySettings {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.reconnect_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_reconnect_delay_ms))
    }
}

/// A STUN or TURN server handed to every connection primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendezvousServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSettings {
    pub servers: Vec<RendezvousServer>,
}

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            servers: vec![RendezvousServer {
                urls: vec![DEFAULT_STUN_URL.to_owned()],
                username: None,
                credential: None,
            }],
        }
    }
}

/// What the controller does with a peer whose connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave the failed session registered; the application decides.
    #[default]
    Keep,
    /// Destroy and unregister the session.
    Remove,
    /// Re-initiate up to `max_attempts` times, then behave like `Keep`.
    /// Failed responder sessions are removed so the remote side can re-offer.
    ///
    /// A retry only lands if the remote peer has already dropped its session for
    /// us, which means it runs `remove` or `retry` too and has seen the failure.
    /// Otherwise it ignores the new offer as a duplicate and the attempt is spent.
    Retry { max_attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationSettings {
    pub failure_policy: FailurePolicy,
}
