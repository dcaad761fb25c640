use mesh_room::config::FailurePolicy;
use mesh_room::error::{PeerNegotiationError, RelayError};
use mesh_room::media::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
use mesh_room::primitive::{
    ConnectionPrimitive, NegotiationRole, PeerEventSink, PrimitiveConfig, PrimitiveEvent,
    PrimitiveFactory,
};
use mesh_room::relay::RelayLifecycle;
use mesh_room::room::{Command, ControllerPhase, ControllerSettings, NegotiationController};
use mesh_room::signaling::{CandidateInit, InboundEvent, OutboundEvent, Participant, Signal};
use mesh_room::{ConnectionState, SignalSender};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What one fake primitive was asked to do.
struct PeerLog {
    user_id: String,
    role: NegotiationRole,
    events: PeerEventSink,
    signals: Vec<Signal>,
    replaced: Vec<(TrackKind, String)>,
    destroyed: usize,
}

#[derive(Default)]
struct Lab {
    peers: Vec<PeerLog>,
}

struct FakePrimitive {
    lab: Arc<Mutex<Lab>>,
    index: usize,
}

impl ConnectionPrimitive for FakePrimitive {
    fn apply_remote_signal(&mut self, signal: Signal) -> Result<(), PeerNegotiationError> {
        let mut lab = self.lab.lock();
        let log = &mut lab.peers[self.index];
        if matches!(signal, Signal::Offer { .. }) && log.role == NegotiationRole::Responder {
            log.events.emit(PrimitiveEvent::Signal(Signal::Answer {
                sdp: format!("answer-to-{}", log.user_id),
            }));
        }
        log.signals.push(signal);
        Ok(())
    }

    fn replace_outbound_track(
        &mut self,
        kind: TrackKind,
        track: LocalTrack,
    ) -> Result<(), PeerNegotiationError> {
        self.lab.lock().peers[self.index]
            .replaced
            .push((kind, track.id().to_owned()));
        Ok(())
    }

    fn destroy(&mut self) {
        self.lab.lock().peers[self.index].destroyed += 1;
    }
}

/// Initiators offer as soon as they are created, like the real primitive does.
struct FakeFactory {
    lab: Arc<Mutex<Lab>>,
}

impl PrimitiveFactory for FakeFactory {
    fn create(
        &self,
        config: PrimitiveConfig,
    ) -> Result<Box<dyn ConnectionPrimitive>, PeerNegotiationError> {
        let user_id = config.events.user_id().to_owned();
        if config.role == NegotiationRole::Initiator {
            config.events.emit(PrimitiveEvent::Signal(Signal::Offer {
                sdp: format!("offer-to-{}", user_id),
            }));
        }
        let mut lab = self.lab.lock();
        lab.peers.push(PeerLog {
            user_id,
            role: config.role,
            events: config.events,
            signals: Vec::new(),
            replaced: Vec::new(),
            destroyed: 0,
        });
        Ok(Box::new(FakePrimitive {
            lab: Arc::clone(&self.lab),
            index: lab.peers.len() - 1,
        }))
    }
}

#[derive(Default, Clone)]
struct Outbox(Arc<Mutex<Vec<OutboundEvent>>>);

impl SignalSender for Outbox {
    fn send(&self, event: OutboundEvent) -> Result<(), RelayError> {
        self.0.lock().push(event);
        Ok(())
    }
}

struct Harness {
    controller: NegotiationController,
    commands: mpsc::UnboundedReceiver<Command>,
    lab: Arc<Mutex<Lab>>,
    outbox: Outbox,
}

impl Harness {
    fn new(local_user: &str) -> Self {
        Self::with_policy(local_user, FailurePolicy::Keep)
    }

    fn with_policy(local_user: &str, failure_policy: FailurePolicy) -> Self {
        let lab = Arc::new(Mutex::new(Lab::default()));
        let outbox = Outbox::default();
        let settings = ControllerSettings {
            rendezvous: Vec::new(),
            failure_policy,
        };
        let (controller, commands) = NegotiationController::new(
            local_user,
            settings,
            Box::new(FakeFactory {
                lab: Arc::clone(&lab),
            }),
            Arc::new(outbox.clone()),
        );
        Self {
            controller,
            commands,
            lab,
            outbox,
        }
    }

    /// Dispatches `command`, then everything it caused, until the queue is empty.
    fn run(&mut self, command: Command) {
        self.controller.dispatch(command);
        while let Ok(next) = self.commands.try_recv() {
            self.controller.dispatch(next);
        }
    }

    fn relay(&mut self, event: InboundEvent) {
        self.run(Command::Relay(event));
    }

    fn initialize(&mut self, members: &[&str]) {
        let members = members.iter().map(|id| Participant::new(*id, *id)).collect();
        self.run(Command::Initialize {
            members,
            local_stream: stream("mic-1"),
        });
    }

    fn offer_from(&mut self, user_id: &str) {
        self.relay(InboundEvent::Offer {
            from_user_id: user_id.to_owned(),
            from_username: Some(user_id.to_owned()),
            offer: Signal::Offer {
                sdp: format!("offer-from-{}", user_id),
            },
        });
    }

    /// Emits `event` through the sink of the most recent primitive for `user_id`.
    fn primitive_event(&mut self, user_id: &str, event: PrimitiveEvent) {
        let sink = self.sink(user_id);
        sink.emit(event);
        while let Ok(next) = self.commands.try_recv() {
            self.controller.dispatch(next);
        }
    }

    fn sink(&self, user_id: &str) -> PeerEventSink {
        self.lab
            .lock()
            .peers
            .iter()
            .rev()
            .find(|p| p.user_id == user_id)
            .map(|p| p.events.clone())
            .expect("no primitive for user")
    }

    fn primitives_for(&self, user_id: &str) -> usize {
        self.lab
            .lock()
            .peers
            .iter()
            .filter(|p| p.user_id == user_id)
            .count()
    }

    fn destroyed(&self, user_id: &str) -> usize {
        self.lab
            .lock()
            .peers
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.destroyed)
            .sum()
    }

    fn sent(&self) -> Vec<OutboundEvent> {
        self.outbox.0.lock().clone()
    }

    fn sent_named(&self, name: &str) -> Vec<OutboundEvent> {
        self.sent().into_iter().filter(|e| e.name() == name).collect()
    }
}

fn stream(audio_id: &str) -> LocalStream {
    LocalStream::new("local", vec![LocalTrack::audio(audio_id, "local")])
}

fn av_stream(audio_id: &str, video_id: &str) -> LocalStream {
    LocalStream::new(
        "local",
        vec![
            LocalTrack::audio(audio_id, "local"),
            LocalTrack::video(video_id, "local"),
        ],
    )
}

fn candidate() -> Signal {
    Signal::Candidate {
        candidate: CandidateInit {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    }
}

#[test]
fn joiner_initiates_toward_existing_member() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice", "bob"]);

    let registry = h.controller.registry();
    assert_eq!(registry.len(), 1);
    let session = registry.get("alice").unwrap();
    assert_eq!(session.role(), NegotiationRole::Initiator);
    assert_eq!(h.controller.phase(), ControllerPhase::Active);

    let offers = h.sent_named("offer");
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].target(), Some("alice"));
}

#[test]
fn inbound_offer_creates_responder_and_answers_once() {
    let mut h = Harness::new("bob");
    h.initialize(&[]);
    h.offer_from("carol");

    let session = h.controller.registry().get("carol").unwrap();
    assert_eq!(session.role(), NegotiationRole::Responder);
    assert_eq!(session.profile().username, "carol");

    let answers = h.sent_named("answer");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].target(), Some("carol"));
}

#[test]
fn participant_left_destroys_session_once() {
    let mut h = Harness::new("bob");
    h.initialize(&[]);
    h.offer_from("carol");
    assert!(h.controller.view().states.contains_key("carol"));

    h.relay(InboundEvent::ParticipantLeft {
        user_id: "carol".into(),
    });
    h.relay(InboundEvent::ParticipantLeft {
        user_id: "carol".into(),
    });

    assert!(h.controller.registry().get("carol").is_none());
    assert_eq!(h.destroyed("carol"), 1);
    assert!(!h.controller.view().states.contains_key("carol"));
}

#[test]
fn local_stream_update_replaces_each_kind_once_per_session() {
    let mut h = Harness::new("bob");
    h.run(Command::Initialize {
        members: vec![Participant::new("alice", "alice")],
        local_stream: av_stream("mic-1", "cam-1"),
    });
    h.offer_from("carol");
    assert_eq!(h.primitives_for("alice") + h.primitives_for("carol"), 2);

    h.run(Command::UpdateLocalStream(av_stream("mic-2", "cam-2")));

    let lab = h.lab.lock();
    for peer in &lab.peers {
        assert_eq!(
            peer.replaced,
            vec![
                (TrackKind::Audio, "mic-2".to_owned()),
                (TrackKind::Video, "cam-2".to_owned())
            ]
        );
        assert_eq!(peer.destroyed, 0);
    }
    drop(lab);
    assert_eq!(h.controller.registry().len(), 2);
    assert_eq!(h.primitives_for("alice"), 1);
}

#[test]
fn second_initialize_adds_nothing() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice", "carol"]);
    h.initialize(&["alice", "carol", "dave"]);

    assert_eq!(h.controller.registry().len(), 2);
    assert!(h.controller.registry().get("dave").is_none());
    assert_eq!(h.sent_named("offer").len(), 2);
}

#[test]
fn offer_for_existing_session_is_dropped() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.offer_from("alice");

    assert_eq!(h.controller.registry().len(), 1);
    assert_eq!(h.primitives_for("alice"), 1);
    assert_eq!(
        h.controller.registry().get("alice").unwrap().role(),
        NegotiationRole::Initiator
    );
    assert!(h.sent_named("answer").is_empty());
}

#[test]
fn offer_without_local_media_is_dropped() {
    let mut h = Harness::new("bob");
    h.offer_from("carol");
    assert!(h.controller.registry().is_empty());
    assert!(h.sent().is_empty());
}

#[test]
fn answer_and_candidate_for_unknown_peer_are_dropped() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);

    h.relay(InboundEvent::Answer {
        from_user_id: "mallory".into(),
        from_username: None,
        answer: Signal::Answer { sdp: "v=0".into() },
    });
    h.relay(InboundEvent::IceCandidate {
        from_user_id: "mallory".into(),
        from_username: None,
        candidate: candidate(),
    });

    assert_eq!(h.controller.registry().len(), 1);
    assert_eq!(h.primitives_for("mallory"), 0);
}

#[test]
fn answer_and_candidate_reach_the_right_session() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice", "carol"]);

    h.relay(InboundEvent::Answer {
        from_user_id: "alice".into(),
        from_username: None,
        answer: Signal::Answer { sdp: "v=0".into() },
    });
    h.relay(InboundEvent::IceCandidate {
        from_user_id: "alice".into(),
        from_username: None,
        candidate: candidate(),
    });

    let lab = h.lab.lock();
    let alice = lab.peers.iter().find(|p| p.user_id == "alice").unwrap();
    let carol = lab.peers.iter().find(|p| p.user_id == "carol").unwrap();
    assert_eq!(alice.signals.len(), 2);
    assert!(carol.signals.is_empty());
}

#[test]
fn registry_stays_unique_across_join_leave_sequences() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    for _ in 0..3 {
        h.offer_from("carol");
        h.offer_from("alice");
        h.relay(InboundEvent::ParticipantJoined {
            user: Participant::new("carol", "carol"),
        });
        h.relay(InboundEvent::ParticipantLeft {
            user_id: "carol".into(),
        });
        h.offer_from("carol");
    }

    let view = h.controller.view();
    let ids: Vec<_> = view.peers.iter().map(|p| p.user_id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "carol"]);
    assert_eq!(h.primitives_for("alice"), 1);
    assert_eq!(h.primitives_for("carol"), 4);
    assert_eq!(h.destroyed("carol"), 3);
    assert_eq!(view.states.len(), view.peers.len());
}

#[test]
fn participant_joined_only_records_profile() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);

    let mut dave = Participant::new("dave", "dave");
    dave.first_name = Some("Dave".into());
    h.relay(InboundEvent::ParticipantJoined { user: dave });

    assert!(h.controller.registry().get("dave").is_none());
    assert!(h.controller.roster().any(|p| p.user_id == "dave"));

    // When dave's offer arrives the session picks up the recorded profile.
    h.offer_from("dave");
    let view = h.controller.view();
    assert_eq!(view.peer("dave").unwrap().display_name, "Dave");
}

#[test]
fn room_joined_initializes_with_staged_stream() {
    let mut h = Harness::new("bob");
    h.run(Command::StageLocalStream(stream("mic-1")));
    h.relay(InboundEvent::RoomJoined {
        room_id: "standup".into(),
        participants: vec![Participant::new("alice", "alice"), Participant::new("bob", "bob")],
    });

    assert_eq!(h.controller.phase(), ControllerPhase::Active);
    assert_eq!(h.controller.registry().len(), 1);
    assert!(h.controller.local_stream().is_some());
}

#[test]
fn cleanup_tears_down_and_guards_late_events() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.offer_from("carol");
    let alice_sink = h.sink("alice");

    h.run(Command::Cleanup);
    h.run(Command::Cleanup);
    assert_eq!(h.controller.phase(), ControllerPhase::TornDown);
    assert!(h.controller.registry().is_empty());
    assert_eq!(h.destroyed("alice"), 1);
    assert_eq!(h.destroyed("carol"), 1);

    h.offer_from("dave");
    h.relay(InboundEvent::IceCandidate {
        from_user_id: "alice".into(),
        from_username: None,
        candidate: candidate(),
    });
    alice_sink.emit(PrimitiveEvent::Connect);
    h.run(Command::ToggleAudio(false));

    assert!(h.controller.registry().is_empty());
    assert_eq!(h.primitives_for("dave"), 0);
}

fn room_joined(members: &[&str]) -> InboundEvent {
    InboundEvent::RoomJoined {
        room_id: "standup".into(),
        participants: members.iter().map(|id| Participant::new(*id, *id)).collect(),
    }
}

#[test]
fn room_joined_after_cleanup_opens_nothing() {
    let mut h = Harness::new("bob");
    h.run(Command::StageLocalStream(stream("mic-1")));
    h.relay(room_joined(&["alice", "bob"]));
    assert_eq!(h.primitives_for("alice"), 1);

    h.run(Command::Cleanup);
    h.relay(room_joined(&["alice", "bob"]));

    assert_eq!(h.controller.phase(), ControllerPhase::TornDown);
    assert!(h.controller.registry().is_empty());
    assert_eq!(h.primitives_for("alice"), 1);
    assert_eq!(h.controller.roster().count(), 0);
}

#[test]
fn snapshot_after_reconnect_reconciles_sessions() {
    let mut h = Harness::new("bob");
    h.run(Command::StageLocalStream(stream("mic-1")));
    h.relay(room_joined(&["alice", "carol", "bob"]));
    assert_eq!(h.controller.registry().len(), 2);

    h.run(Command::Lifecycle(RelayLifecycle::Disconnected));
    h.run(Command::Lifecycle(RelayLifecycle::Reconnected));
    h.relay(room_joined(&["alice", "erin", "bob"]));

    let registry = h.controller.registry();
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.get("erin").unwrap().role(),
        NegotiationRole::Initiator
    );
    assert!(registry.get("carol").is_none());
    assert!(registry.get("bob").is_none());
    assert_eq!(h.primitives_for("alice"), 1);
    assert_eq!(h.destroyed("alice"), 0);
    assert_eq!(h.destroyed("carol"), 1);

    let offers: Vec<_> = h
        .sent_named("offer")
        .into_iter()
        .filter_map(|e| e.target().map(str::to_owned))
        .collect();
    assert_eq!(offers.iter().filter(|t| *t == "erin").count(), 1);
    assert!(h.controller.roster().any(|p| p.user_id == "erin"));
    assert!(!h.controller.roster().any(|p| p.user_id == "carol"));
    assert_eq!(h.controller.phase(), ControllerPhase::Active);
}

#[test]
fn initialize_after_cleanup_starts_over() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.run(Command::Cleanup);
    h.initialize(&["alice"]);

    assert_eq!(h.controller.phase(), ControllerPhase::Active);
    assert_eq!(h.controller.registry().len(), 1);
    assert_eq!(h.primitives_for("alice"), 2);
}

#[test]
fn connect_and_stream_update_the_view() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    assert_eq!(h.controller.view().states["alice"], ConnectionState::Connecting);

    h.primitive_event(
        "alice",
        PrimitiveEvent::Stream(RemoteStream {
            id: "alice-stream".into(),
            tracks: vec![RemoteTrack {
                kind: TrackKind::Audio,
                id: "a0".into(),
                handle: None,
            }],
        }),
    );

    let view = h.controller.view();
    assert_eq!(view.states["alice"], ConnectionState::Connected);
    assert_eq!(view.connected_count(), 1);
    let remote = view.peer("alice").unwrap().remote_stream.as_ref().unwrap();
    assert!(remote.has(TrackKind::Audio));
}

#[test]
fn events_from_a_replaced_session_are_ignored() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.offer_from("carol");
    let stale = h.sink("carol");

    h.relay(InboundEvent::ParticipantLeft {
        user_id: "carol".into(),
    });
    h.offer_from("carol");
    assert_ne!(stale.generation(), h.sink("carol").generation());

    stale.emit(PrimitiveEvent::Close);
    stale.emit(PrimitiveEvent::Connect);
    h.run(Command::ToggleAudio(true));

    let view = h.controller.view();
    assert_eq!(view.states["carol"], ConnectionState::Connecting);
    assert_eq!(h.destroyed("carol"), 1);
}

#[test]
fn closed_primitive_removes_its_session() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.primitive_event("alice", PrimitiveEvent::Close);

    assert!(h.controller.registry().is_empty());
    assert_eq!(h.destroyed("alice"), 1);
}

#[test]
fn failed_session_is_kept_by_default() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.primitive_event("alice", PrimitiveEvent::Error("ice failed".into()));

    assert_eq!(h.controller.view().states["alice"], ConnectionState::Failed);
    assert_eq!(h.destroyed("alice"), 0);
}

#[test]
fn failed_session_is_removed_under_remove_policy() {
    let mut h = Harness::with_policy("bob", FailurePolicy::Remove);
    h.initialize(&["alice"]);
    h.primitive_event("alice", PrimitiveEvent::Error("ice failed".into()));

    assert!(h.controller.registry().is_empty());
    assert_eq!(h.destroyed("alice"), 1);
}

#[test]
fn failed_initiator_is_retried_until_attempts_run_out() {
    let mut h = Harness::with_policy("bob", FailurePolicy::Retry { max_attempts: 2 });
    h.initialize(&["alice"]);

    h.primitive_event("alice", PrimitiveEvent::Error("ice failed".into()));
    h.primitive_event("alice", PrimitiveEvent::Error("ice failed".into()));
    assert_eq!(h.primitives_for("alice"), 3);
    assert_eq!(h.sent_named("offer").len(), 3);
    assert_eq!(h.controller.registry().get("alice").unwrap().retries(), 2);

    h.primitive_event("alice", PrimitiveEvent::Error("ice failed".into()));
    assert_eq!(h.primitives_for("alice"), 3);
    assert_eq!(h.controller.view().states["alice"], ConnectionState::Failed);
}

#[test]
fn failed_responder_is_dropped_under_retry_policy() {
    let mut h = Harness::with_policy("bob", FailurePolicy::Retry { max_attempts: 3 });
    h.initialize(&[]);
    h.offer_from("carol");
    h.primitive_event("carol", PrimitiveEvent::Error("dtls".into()));

    assert!(h.controller.registry().is_empty());
    assert_eq!(h.primitives_for("carol"), 1);
}

#[test]
fn toggles_flip_local_tracks_and_notify_relay() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.run(Command::ToggleAudio(false));

    let local = h.controller.local_stream().unwrap();
    assert!(!local.track(TrackKind::Audio).unwrap().is_enabled());
    assert_eq!(
        h.sent_named("toggle-audio"),
        vec![OutboundEvent::ToggleAudio { enabled: false }]
    );
}

#[test]
fn screen_share_swaps_video_and_restores_camera() {
    let mut h = Harness::new("bob");
    h.run(Command::Initialize {
        members: vec![Participant::new("alice", "alice")],
        local_stream: av_stream("mic-1", "cam-1"),
    });

    let display = LocalStream::new("screen", vec![LocalTrack::video("screen-1", "screen")]);
    h.run(Command::StartScreenShare(display));
    h.run(Command::StopScreenShare);

    let lab = h.lab.lock();
    let videos: Vec<_> = lab.peers[0]
        .replaced
        .iter()
        .filter(|(kind, _)| *kind == TrackKind::Video)
        .map(|(_, id)| id.as_str())
        .collect();
    assert_eq!(videos, vec!["screen-1", "cam-1"]);
    drop(lab);

    assert_eq!(h.sent_named("start-screen-share").len(), 1);
    assert_eq!(h.sent_named("stop-screen-share").len(), 1);
    let local = h.controller.local_stream().unwrap();
    assert_eq!(local.track(TrackKind::Video).unwrap().id(), "cam-1");
}

#[test]
fn media_state_events_update_peer_summary() {
    let mut h = Harness::new("bob");
    h.initialize(&["alice"]);
    h.relay(InboundEvent::ParticipantAudioChanged {
        user_id: "alice".into(),
        enabled: false,
    });
    h.relay(InboundEvent::ScreenShareStarted {
        user_id: "alice".into(),
    });

    let view = h.controller.view();
    let alice = view.peer("alice").unwrap();
    assert!(!alice.audio_enabled);
    assert!(alice.screen_sharing);
}

#[tokio::test]
async fn handle_drives_a_spawned_controller() {
    let lab = Arc::new(Mutex::new(Lab::default()));
    let outbox = Outbox::default();
    let (controller, commands) = NegotiationController::new(
        "bob",
        ControllerSettings::default(),
        Box::new(FakeFactory {
            lab: Arc::clone(&lab),
        }),
        Arc::new(outbox.clone()),
    );
    let handle = controller.handle();
    let mut view = handle.subscribe();
    let task = controller.spawn(commands);

    handle.initialize(vec![Participant::new("alice", "alice")], stream("mic-1"));
    view.wait_for(|v| v.states.contains_key("alice"))
        .await
        .unwrap();

    handle.shutdown();
    task.await.unwrap();
    assert_eq!(handle.view().phase, ControllerPhase::TornDown);
    assert_eq!(lab.lock().peers[0].destroyed, 1);
}
