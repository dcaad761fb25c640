use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::media::TrackKind;

/// Relay unreachable or the WebSocket handshake failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid relay request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("relay handshake failed after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: WsError,
    },
}

/// Local send failures. The relay client never queues while disconnected.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is not connected")]
    NotConnected,

    #[error("failed to encode {event}: {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Camera, microphone or screen capture could not be acquired.
#[derive(Debug, Error)]
pub enum MediaAccessError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("no {0} device available")]
    DeviceUnavailable(String),

    #[error("{0} capture is not supported on this platform")]
    Unsupported(String),

    #[error("capture stream failed: {0}")]
    Stream(String),
}

/// Inbound signal that cannot be routed to a peer. Always logged and dropped.
#[derive(Debug, Error)]
pub enum SignalingRoutingError {
    #[error("{event} from unknown peer {user_id}")]
    UnknownPeer { event: &'static str, user_id: String },

    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
}

/// Failure reported by, or while driving, a connection primitive.
#[derive(Debug, Error)]
pub enum PeerNegotiationError {
    #[error("failed to set up peer connection: {0}")]
    Setup(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("no outbound {0} sender to replace")]
    NoSender(TrackKind),

    #[error("connection primitive for {0} is gone")]
    Gone(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors surfaced across the client boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
