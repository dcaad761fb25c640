use std::collections::BTreeMap;

use crate::connection::ConnectionState;
use crate::media::RemoteStream;
use crate::primitive::NegotiationRole;
use crate::signaling::{ParticipantRole, UserId};

/// Lifecycle of the controller for one room membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerPhase {
    #[default]
    Idle,
    Initializing,
    Active,
    TornDown,
}

/// One remote peer as the application sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub negotiation_role: NegotiationRole,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
    pub state: ConnectionState,
    pub remote_stream: Option<RemoteStream>,
}

/// Aggregated peer list and connection-state map.
///
/// `states` has an entry for exactly the peers in `peers`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    pub phase: ControllerPhase,
    pub peers: Vec<PeerSummary>,
    pub states: BTreeMap<UserId, ConnectionState>,
}

impl RoomView {
    pub fn peer(&self, user_id: &str) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| p.user_id == user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == ConnectionState::Connected)
            .count()
    }
}
