//! Relay wire protocol.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`. The relay forwards
//! offer/answer/candidate payloads between participants without reading them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingRoutingError;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    #[default]
    Attendee,
}

/// A room member as described by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: ParticipantRole,
    #[serde(default = "enabled")]
    pub audio_enabled: bool,
    #[serde(default = "enabled")]
    pub video_enabled: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub hand_raised: bool,
}

fn enabled() -> bool {
    true
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            first_name: None,
            last_name: None,
            role: ParticipantRole::Attendee,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
            hand_raised: false,
        }
    }

    /// "First Last" when the relay supplied name parts, otherwise the username.
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            self.username.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Signaling blob produced and consumed by a connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidateInit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Answer { .. } => SignalKind::Answer,
            Signal::Candidate { .. } => SignalKind::Candidate,
        }
    }

    /// Relay event that carries a signal of this kind.
    pub fn into_outbound(self, target_user_id: UserId) -> OutboundEvent {
        match self.kind() {
            SignalKind::Offer => OutboundEvent::Offer {
                target_user_id,
                offer: self,
            },
            SignalKind::Answer => OutboundEvent::Answer {
                target_user_id,
                answer: self,
            },
            SignalKind::Candidate => OutboundEvent::IceCandidate {
                target_user_id,
                candidate: self,
            },
        }
    }
}

/// Events this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    Offer { target_user_id: UserId, offer: Signal },
    #[serde(rename_all = "camelCase")]
    Answer { target_user_id: UserId, answer: Signal },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_user_id: UserId,
        candidate: Signal,
    },
    ToggleAudio { enabled: bool },
    ToggleVideo { enabled: bool },
    StartScreenShare {},
    StopScreenShare {},
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom { .. } => "join-room",
            OutboundEvent::LeaveRoom { .. } => "leave-room",
            OutboundEvent::Offer { .. } => "offer",
            OutboundEvent::Answer { .. } => "answer",
            OutboundEvent::IceCandidate { .. } => "ice-candidate",
            OutboundEvent::ToggleAudio { .. } => "toggle-audio",
            OutboundEvent::ToggleVideo { .. } => "toggle-video",
            OutboundEvent::StartScreenShare {} => "start-screen-share",
            OutboundEvent::StopScreenShare {} => "stop-screen-share",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            OutboundEvent::Offer { target_user_id, .. }
            | OutboundEvent::Answer { target_user_id, .. }
            | OutboundEvent::IceCandidate { target_user_id, .. } => Some(target_user_id),
            _ => None,
        }
    }
}

/// Events the relay delivers that the negotiation engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        participants: Vec<Participant>,
    },
    ParticipantJoined { user: Participant },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    Offer {
        from_user_id: UserId,
        #[serde(default)]
        from_username: Option<String>,
        offer: Signal,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from_user_id: UserId,
        #[serde(default)]
        from_username: Option<String>,
        answer: Signal,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from_user_id: UserId,
        #[serde(default)]
        from_username: Option<String>,
        candidate: Signal,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantAudioChanged { user_id: UserId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    ParticipantVideoChanged { user_id: UserId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped { user_id: UserId },
}

impl InboundEvent {
    pub const NAMES: &'static [&'static str] = &[
        "room-joined",
        "participant-joined",
        "participant-left",
        "offer",
        "answer",
        "ice-candidate",
        "participant-audio-changed",
        "participant-video-changed",
        "screen-share-started",
        "screen-share-stopped",
    ];

    pub fn decode(event: &str, data: &Value) -> Result<Self, SignalingRoutingError> {
        let frame = serde_json::json!({ "event": event, "data": data });
        serde_json::from_value(frame).map_err(|e| SignalingRoutingError::Malformed {
            event: event.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Raw frame as it travels over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
