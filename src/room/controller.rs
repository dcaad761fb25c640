//! Per-room negotiation controller.
//!
//! Protocol contract: a participant that joins a room initiates a connection
//! to every participant already present, and never initiates toward someone who
//! joins after it. Every client must follow this rule; it yields exactly one
//! connection attempt per pair without leader election. If two clients still
//! offer to each other, whichever offer arrives after a local session exists is
//! dropped.
//!
//! All state lives in [`NegotiationController`] and is mutated only from its event
//! loop, one [`Command`] at a time.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FailurePolicy, RendezvousServer};
use crate::connection::ConnectionMonitor;
use crate::error::SignalingRoutingError;
use crate::media::{LocalStream, TrackKind};
use crate::primitive::{
    NegotiationRole, PeerEventSink, PrimitiveConfig, PrimitiveEvent, PrimitiveFactory,
};
use crate::relay::{RelayLifecycle, SignalSender};
use crate::room::command::Command;
use crate::room::registry::{DuplicatePeer, PeerRegistry};
use crate::room::session::{PeerSession, SessionOutcome};
use crate::room::state::{ControllerPhase, RoomView};
use crate::signaling::{InboundEvent, OutboundEvent, Participant, Signal, UserId};

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub rendezvous: Vec<RendezvousServer>,
    pub failure_policy: FailurePolicy,
}

pub struct NegotiationController {
    local_user_id: UserId,
    settings: ControllerSettings,
    phase: ControllerPhase,
    registry: PeerRegistry,
    roster: HashMap<UserId, Participant>,
    local_stream: Option<LocalStream>,
    staged_stream: Option<LocalStream>,
    /// Camera stream saved while a display track is being shared.
    camera_stream: Option<LocalStream>,
    next_generation: u64,
    factory: Box<dyn PrimitiveFactory>,
    relay: Arc<dyn SignalSender>,
    commands: mpsc::UnboundedSender<Command>,
    monitor: ConnectionMonitor,
}

impl NegotiationController {
    pub fn new(
        local_user_id: impl Into<UserId>,
        settings: ControllerSettings,
        factory: Box<dyn PrimitiveFactory>,
        relay: Arc<dyn SignalSender>,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let controller = Self {
            local_user_id: local_user_id.into(),
            settings,
            phase: ControllerPhase::Idle,
            registry: PeerRegistry::new(),
            roster: HashMap::new(),
            local_stream: None,
            staged_stream: None,
            camera_stream: None,
            next_generation: 0,
            factory,
            relay,
            commands,
            monitor: ConnectionMonitor::new(),
        };
        (controller, rx)
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.commands.clone(),
            monitor: self.monitor.clone(),
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn roster(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values()
    }

    /// Runs the event loop until [`Command::Shutdown`], then cleans up.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if !self.dispatch(command) {
                break;
            }
        }
        self.cleanup();
        self.publish();
        debug!(user_id = %self.local_user_id, "controller loop stopped");
    }

    pub fn spawn(self, commands: mpsc::UnboundedReceiver<Command>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    /// Applies one command and publishes the resulting view. Returns `false` once
    /// the loop should stop.
    pub fn dispatch(&mut self, command: Command) -> bool {
        let keep_running = match command {
            Command::Initialize {
                members,
                local_stream,
            } => {
                self.initialize(members, local_stream);
                true
            }
            Command::StageLocalStream(stream) => {
                self.staged_stream = Some(stream);
                true
            }
            Command::Relay(event) => {
                self.handle_relay_event(event);
                true
            }
            Command::Lifecycle(event) => {
                self.handle_lifecycle(event);
                true
            }
            Command::Peer {
                user_id,
                generation,
                event,
            } => {
                self.handle_peer_event(&user_id, generation, event);
                true
            }
            Command::UpdateLocalStream(stream) => {
                self.update_local_stream(stream);
                true
            }
            Command::ToggleAudio(enabled) => {
                self.toggle_media(TrackKind::Audio, enabled);
                true
            }
            Command::ToggleVideo(enabled) => {
                self.toggle_media(TrackKind::Video, enabled);
                true
            }
            Command::StartScreenShare(display) => {
                self.start_screen_share(display);
                true
            }
            Command::StopScreenShare => {
                self.stop_screen_share();
                true
            }
            Command::Cleanup => {
                self.cleanup();
                true
            }
            Command::Shutdown => false,
        };
        self.publish();
        keep_running
    }

    /// Creates an initiator session toward every member other than ourselves.
    /// Ignored while already initializing or active.
    pub fn initialize(&mut self, members: Vec<Participant>, local_stream: LocalStream) {
        if matches!(
            self.phase,
            ControllerPhase::Initializing | ControllerPhase::Active
        ) {
            debug!(phase = ?self.phase, "initialize ignored, already running");
            return;
        }

        self.phase = ControllerPhase::Initializing;
        self.local_stream = Some(local_stream);
        info!(
            user_id = %self.local_user_id,
            members = members.len(),
            "initializing room negotiation"
        );

        for member in members {
            if member.user_id == self.local_user_id {
                continue;
            }
            let user_id = member.user_id.clone();
            self.roster.insert(user_id.clone(), member);
            if self.registry.contains(&user_id) {
                debug!(%user_id, "session already exists, not initiating");
                continue;
            }
            self.open_session(&user_id, NegotiationRole::Initiator, None, 0);
        }

        self.phase = ControllerPhase::Active;
    }

    pub fn handle_inbound_offer(
        &mut self,
        from_user_id: &str,
        from_username: Option<String>,
        offer: Signal,
    ) {
        if self.torn_down("offer") {
            return;
        }
        if self.local_stream.is_none() {
            warn!(user_id = %from_user_id, "offer received before local media, dropping");
            return;
        }
        if self.registry.contains(from_user_id) {
            debug!(user_id = %from_user_id, "session already exists, ignoring offer");
            return;
        }
        if let Some(session) =
            self.open_session(from_user_id, NegotiationRole::Responder, from_username, 0)
        {
            session.apply_remote_signal(offer);
        }
    }

    pub fn handle_inbound_answer(&mut self, from_user_id: &str, answer: Signal) {
        self.route_signal("answer", from_user_id, answer);
    }

    pub fn handle_inbound_candidate(&mut self, from_user_id: &str, candidate: Signal) {
        self.route_signal("ice-candidate", from_user_id, candidate);
    }

    pub fn handle_participant_joined(&mut self, participant: Participant) {
        if self.torn_down("participant-joined") || participant.user_id == self.local_user_id {
            return;
        }
        // The newcomer initiates toward us; only record who they are.
        info!(user_id = %participant.user_id, "participant joined");
        if let Some(session) = self.registry.get_mut(&participant.user_id) {
            *session.profile_mut() = participant.clone();
        }
        self.roster
            .insert(participant.user_id.clone(), participant);
    }

    pub fn handle_participant_left(&mut self, user_id: &str) {
        if self.torn_down("participant-left") {
            return;
        }
        self.roster.remove(user_id);
        match self.registry.remove(user_id) {
            Some(mut session) => {
                info!(%user_id, "participant left, closing session");
                session.destroy();
            }
            None => debug!(%user_id, "participant left without a session"),
        }
    }

    /// Substitutes the outbound tracks of every live session without
    /// renegotiating.
    pub fn update_local_stream(&mut self, stream: LocalStream) {
        if self.torn_down("update-local-stream") {
            return;
        }
        for session in self.registry.iter_mut() {
            session.replace_tracks(&stream);
        }
        self.local_stream = Some(stream);
    }

    pub fn toggle_media(&mut self, kind: TrackKind, enabled: bool) {
        let Some(stream) = &self.local_stream else {
            warn!(%kind, "no local media to toggle");
            return;
        };
        stream.set_enabled(kind, enabled);
        if let Some(camera) = &self.camera_stream {
            camera.set_enabled(kind, enabled);
        }
        let event = match kind {
            TrackKind::Audio => OutboundEvent::ToggleAudio { enabled },
            TrackKind::Video => OutboundEvent::ToggleVideo { enabled },
        };
        self.send(event);
    }

    /// Replaces the outbound video with the display stream's video track.
    pub fn start_screen_share(&mut self, display: LocalStream) {
        let Some(current) = self.local_stream.clone() else {
            warn!("no local media, cannot share screen");
            return;
        };
        let Some(screen) = display.track(TrackKind::Video).cloned() else {
            warn!("display stream has no video track");
            return;
        };
        if self.camera_stream.is_none() {
            self.camera_stream = Some(current.clone());
        }
        info!("starting screen share");
        self.update_local_stream(current.with_track(screen));
        self.send(OutboundEvent::StartScreenShare {});
    }

    pub fn stop_screen_share(&mut self) {
        let Some(camera) = self.camera_stream.take() else {
            debug!("not sharing, nothing to stop");
            return;
        };
        info!("stopping screen share");
        self.update_local_stream(camera);
        self.send(OutboundEvent::StopScreenShare {});
    }

    /// Destroys every session and forgets the room. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        let sessions = self.registry.drain();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "cleaning up peer sessions");
        }
        for mut session in sessions {
            session.destroy();
        }
        self.roster.clear();
        self.local_stream = None;
        self.staged_stream = None;
        self.camera_stream = None;
        self.phase = ControllerPhase::TornDown;
    }

    pub fn view(&self) -> RoomView {
        let mut peers: Vec<_> = self.registry.iter().map(PeerSession::summary).collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let states = peers
            .iter()
            .map(|p| (p.user_id.clone(), p.state))
            .collect();
        RoomView {
            phase: self.phase,
            peers,
            states,
        }
    }

    fn publish(&self) {
        self.monitor.publish(self.view());
    }

    fn handle_relay_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::RoomJoined {
                room_id,
                participants,
            } => {
                if self.torn_down("room-joined") {
                    return;
                }
                info!(%room_id, participants = participants.len(), "room joined");
                if self.phase == ControllerPhase::Active {
                    self.reconcile(participants);
                    return;
                }
                match self.staged_stream.clone() {
                    Some(stream) => self.initialize(participants, stream),
                    None => {
                        warn!(%room_id, "room joined without staged local media, waiting for initialize");
                        for member in participants {
                            if member.user_id != self.local_user_id {
                                self.roster.insert(member.user_id.clone(), member);
                            }
                        }
                    }
                }
            }
            InboundEvent::ParticipantJoined { user } => self.handle_participant_joined(user),
            InboundEvent::ParticipantLeft { user_id } => self.handle_participant_left(&user_id),
            InboundEvent::Offer {
                from_user_id,
                from_username,
                offer,
            } => self.handle_inbound_offer(&from_user_id, from_username, offer),
            InboundEvent::Answer {
                from_user_id,
                answer,
                ..
            } => self.handle_inbound_answer(&from_user_id, answer),
            InboundEvent::IceCandidate {
                from_user_id,
                candidate,
                ..
            } => self.handle_inbound_candidate(&from_user_id, candidate),
            InboundEvent::ParticipantAudioChanged { user_id, enabled } => {
                self.update_participant(&user_id, |p| p.audio_enabled = enabled)
            }
            InboundEvent::ParticipantVideoChanged { user_id, enabled } => {
                self.update_participant(&user_id, |p| p.video_enabled = enabled)
            }
            InboundEvent::ScreenShareStarted { user_id } => {
                self.update_participant(&user_id, |p| p.screen_sharing = true)
            }
            InboundEvent::ScreenShareStopped { user_id } => {
                self.update_participant(&user_id, |p| p.screen_sharing = false)
            }
        }
    }

    /// Brings an active room in line with a fresh snapshot, as sent after the relay
    /// re-joins us. The relay treats us as a new joiner, so members without a
    /// session get an initiator session and sessions for absent members close.
    fn reconcile(&mut self, participants: Vec<Participant>) {
        let members: HashMap<UserId, Participant> = participants
            .into_iter()
            .filter(|p| p.user_id != self.local_user_id)
            .map(|p| (p.user_id.clone(), p))
            .collect();

        let gone: Vec<UserId> = self
            .registry
            .iter()
            .map(|s| s.user_id().to_owned())
            .filter(|id| !members.contains_key(id))
            .collect();
        for user_id in gone {
            info!(%user_id, "peer missing from room snapshot, closing session");
            self.drop_session(&user_id);
        }

        for (user_id, member) in &members {
            if let Some(session) = self.registry.get_mut(user_id) {
                *session.profile_mut() = member.clone();
            }
        }
        self.roster = members;

        let missing: Vec<UserId> = self
            .roster
            .keys()
            .filter(|id| !self.registry.contains(id))
            .cloned()
            .collect();
        for user_id in missing {
            self.open_session(&user_id, NegotiationRole::Initiator, None, 0);
        }
    }

    fn handle_lifecycle(&mut self, event: RelayLifecycle) {
        match event {
            RelayLifecycle::Disconnected => warn!("relay disconnected, peers keep their media paths"),
            RelayLifecycle::Reconnected => info!("relay reconnected"),
            RelayLifecycle::ReconnectFailed => {
                warn!("relay gone for good, tearing down the room");
                self.cleanup();
            }
        }
    }

    fn handle_peer_event(&mut self, user_id: &str, generation: u64, event: PrimitiveEvent) {
        let Some(session) = self.registry.get_mut(user_id) else {
            debug!(%user_id, generation, "event for a removed session, dropping");
            return;
        };
        if session.generation() != generation {
            debug!(
                %user_id,
                generation,
                current = session.generation(),
                "event from a replaced session, dropping"
            );
            return;
        }

        match session.on_primitive_event(event, self.relay.as_ref()) {
            SessionOutcome::Continue => {}
            SessionOutcome::Closed => {
                if let Some(mut session) = self.registry.remove(user_id) {
                    info!(%user_id, "peer connection closed");
                    session.destroy();
                }
            }
            SessionOutcome::Failed(_) => self.apply_failure_policy(user_id),
        }
    }

    fn apply_failure_policy(&mut self, user_id: &str) {
        let Some(session) = self.registry.get(user_id) else {
            return;
        };
        let role = session.role();
        let retries = session.retries();

        match self.settings.failure_policy {
            FailurePolicy::Keep => {}
            FailurePolicy::Remove => self.drop_session(user_id),
            FailurePolicy::Retry { max_attempts } => match role {
                NegotiationRole::Responder => self.drop_session(user_id),
                NegotiationRole::Initiator if retries < max_attempts => {
                    info!(%user_id, attempt = retries + 1, max_attempts, "re-initiating failed peer");
                    self.drop_session(user_id);
                    self.open_session(user_id, NegotiationRole::Initiator, None, retries + 1);
                }
                NegotiationRole::Initiator => {
                    warn!(%user_id, max_attempts, "retries exhausted, keeping failed session");
                }
            },
        }
    }

    fn drop_session(&mut self, user_id: &str) {
        if let Some(mut session) = self.registry.remove(user_id) {
            session.destroy();
        }
    }

    fn open_session(
        &mut self,
        user_id: &str,
        role: NegotiationRole,
        username: Option<String>,
        retries: u32,
    ) -> Option<&mut PeerSession> {
        let local_stream = self.local_stream.clone()?;
        self.next_generation += 1;
        let generation = self.next_generation;

        let profile = self.roster.get(user_id).cloned().unwrap_or_else(|| {
            let name = username.unwrap_or_else(|| user_id.to_owned());
            Participant::new(user_id, name)
        });

        let events = PeerEventSink::new(user_id.to_owned(), generation, self.commands.clone());
        let primitive = match self.factory.create(PrimitiveConfig {
            role,
            local_stream,
            rendezvous: self.settings.rendezvous.clone(),
            events,
        }) {
            Ok(primitive) => primitive,
            Err(e) => {
                warn!(%user_id, %role, error = %e, "failed to create connection primitive");
                return None;
            }
        };

        info!(%user_id, %role, generation, "opening peer session");
        let session = PeerSession::new(profile, role, generation, primitive).with_retries(retries);
        match self.registry.insert(session) {
            Ok(session) => Some(session),
            Err(DuplicatePeer(mut rejected)) => {
                warn!(%user_id, "duplicate session rejected");
                rejected.destroy();
                None
            }
        }
    }

    fn route_signal(&mut self, event: &'static str, from_user_id: &str, signal: Signal) {
        if self.torn_down(event) {
            return;
        }
        match self.registry.get_mut(from_user_id) {
            Some(session) => session.apply_remote_signal(signal),
            None => {
                let err = SignalingRoutingError::UnknownPeer {
                    event,
                    user_id: from_user_id.to_owned(),
                };
                debug!(error = %err, "dropping signal");
            }
        }
    }

    fn update_participant(&mut self, user_id: &str, update: impl Fn(&mut Participant)) {
        if self.torn_down("media-state") {
            return;
        }
        if let Some(participant) = self.roster.get_mut(user_id) {
            update(participant);
        }
        if let Some(session) = self.registry.get_mut(user_id) {
            update(session.profile_mut());
        }
    }

    fn send(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(e) = self.relay.send(event) {
            warn!(event = name, error = %e, "failed to send to relay");
        }
    }

    fn torn_down(&self, event: &str) -> bool {
        if self.phase == ControllerPhase::TornDown {
            debug!(event, "controller torn down, ignoring");
            return true;
        }
        false
    }
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    monitor: ConnectionMonitor,
}

impl ControllerHandle {
    pub fn sender(&self) -> &mpsc::UnboundedSender<Command> {
        &self.commands
    }

    pub fn initialize(&self, members: Vec<Participant>, local_stream: LocalStream) {
        self.send(Command::Initialize {
            members,
            local_stream,
        });
    }

    pub fn stage_local_stream(&self, stream: LocalStream) {
        self.send(Command::StageLocalStream(stream));
    }

    pub fn update_local_stream(&self, stream: LocalStream) {
        self.send(Command::UpdateLocalStream(stream));
    }

    pub fn toggle_audio(&self, enabled: bool) {
        self.send(Command::ToggleAudio(enabled));
    }

    pub fn toggle_video(&self, enabled: bool) {
        self.send(Command::ToggleVideo(enabled));
    }

    pub fn start_screen_share(&self, display: LocalStream) {
        self.send(Command::StartScreenShare(display));
    }

    pub fn stop_screen_share(&self) {
        self.send(Command::StopScreenShare);
    }

    pub fn cleanup(&self) {
        self.send(Command::Cleanup);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn view(&self) -> RoomView {
        self.monitor.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.monitor.subscribe()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("controller loop has stopped");
        }
    }
}
