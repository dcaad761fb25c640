//! One negotiated connection to one remote participant.

use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::media::{LocalStream, RemoteStream};
use crate::primitive::{ConnectionPrimitive, NegotiationRole, PrimitiveEvent};
use crate::relay::SignalSender;
use crate::room::state::PeerSummary;
use crate::signaling::{Participant, Signal, SignalKind, UserId};

/// What the controller must do after a session consumed a primitive event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Continue,
    Failed(String),
    Closed,
}

pub struct PeerSession {
    user_id: UserId,
    profile: Participant,
    role: NegotiationRole,
    generation: u64,
    retries: u32,
    state: ConnectionState,
    remote_stream: Option<RemoteStream>,
    offer_sent: bool,
    destroyed: bool,
    primitive: Box<dyn ConnectionPrimitive>,
}

impl PeerSession {
    pub fn new(
        profile: Participant,
        role: NegotiationRole,
        generation: u64,
        primitive: Box<dyn ConnectionPrimitive>,
    ) -> Self {
        Self {
            user_id: profile.user_id.clone(),
            profile,
            role,
            generation,
            retries: 0,
            state: ConnectionState::Connecting,
            remote_stream: None,
            offer_sent: false,
            destroyed: false,
            primitive,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn profile(&self) -> &Participant {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut Participant {
        &mut self.profile
    }

    /// Feeds a relayed offer, answer or candidate to the primitive. A rejected
    /// signal is logged; the primitive decides whether the session survives.
    pub fn apply_remote_signal(&mut self, signal: Signal) {
        let kind = signal.kind();
        if let Err(e) = self.primitive.apply_remote_signal(signal) {
            warn!(user_id = %self.user_id, ?kind, error = %e, "remote signal rejected");
        }
    }

    /// Swaps the outbound track of every kind present in `stream`, once per kind.
    pub fn replace_tracks(&mut self, stream: &LocalStream) {
        for kind in stream.kinds() {
            let Some(track) = stream.track(kind) else {
                continue;
            };
            if let Err(e) = self.primitive.replace_outbound_track(kind, track.clone()) {
                warn!(user_id = %self.user_id, %kind, error = %e, "track replacement failed");
            }
        }
    }

    pub fn on_primitive_event(
        &mut self,
        event: PrimitiveEvent,
        relay: &dyn SignalSender,
    ) -> SessionOutcome {
        match event {
            PrimitiveEvent::Signal(signal) => {
                self.dispatch_signal(signal, relay);
                SessionOutcome::Continue
            }
            PrimitiveEvent::Stream(stream) => {
                info!(user_id = %self.user_id, tracks = stream.tracks.len(), "remote stream received");
                self.remote_stream = Some(stream);
                self.state = ConnectionState::Connected;
                SessionOutcome::Continue
            }
            PrimitiveEvent::Connect => {
                info!(user_id = %self.user_id, role = %self.role, "peer connected");
                self.state = ConnectionState::Connected;
                SessionOutcome::Continue
            }
            PrimitiveEvent::Error(reason) => {
                warn!(user_id = %self.user_id, %reason, "peer connection failed");
                self.state = ConnectionState::Failed;
                SessionOutcome::Failed(reason)
            }
            PrimitiveEvent::Close => {
                self.state = ConnectionState::Closed;
                SessionOutcome::Closed
            }
        }
    }

    fn dispatch_signal(&mut self, signal: Signal, relay: &dyn SignalSender) {
        if signal.kind() == SignalKind::Offer {
            if self.offer_sent {
                warn!(user_id = %self.user_id, "primitive produced a second offer, dropping it");
                return;
            }
            self.offer_sent = true;
        }
        let event = signal.into_outbound(self.user_id.clone());
        debug!(user_id = %self.user_id, event = event.name(), "sending signal");
        if let Err(e) = relay.send(event) {
            warn!(user_id = %self.user_id, error = %e, "failed to send signal");
        }
    }

    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.state = ConnectionState::Closed;
        self.remote_stream = None;
        self.primitive.destroy();
        debug!(user_id = %self.user_id, generation = self.generation, "peer session destroyed");
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            user_id: self.user_id.clone(),
            username: self.profile.username.clone(),
            display_name: self.profile.display_name(),
            role: self.profile.role,
            negotiation_role: self.role,
            audio_enabled: self.profile.audio_enabled,
            video_enabled: self.profile.video_enabled,
            screen_sharing: self.profile.screen_sharing,
            hand_raised: self.profile.hand_raised,
            state: self.state,
            remote_stream: self.remote_stream.clone(),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
