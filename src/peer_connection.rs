//! Connection primitive backed by a webrtc-rs `RTCPeerConnection`.
//!
//! Each primitive is a small task that owns its peer connection. The controller
//! talks to it through a queue of [`PeerOp`]s and hears back through the
//! [`PeerEventSink`]. Candidates are never trickled: offers and answers are sent
//! only after ICE gathering completes, with every candidate already in the SDP.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::RendezvousServer;
use crate::error::PeerNegotiationError;
use crate::media::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
use crate::primitive::{
    ConnectionPrimitive, NegotiationRole, PeerEventSink, PrimitiveConfig, PrimitiveEvent,
    PrimitiveFactory,
};
use crate::signaling::{Signal, UserId};

enum PeerOp {
    Signal(Signal),
    ReplaceTrack(TrackKind, LocalTrack),
    Destroy,
}

/// Creates webrtc-rs primitives sharing one configured `API`.
pub struct WebRtcFactory {
    api: Arc<API>,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, PeerNegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerNegotiationError::Setup(format!("failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                PeerNegotiationError::Setup(format!("failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

impl PrimitiveFactory for WebRtcFactory {
    fn create(
        &self,
        config: PrimitiveConfig,
    ) -> Result<Box<dyn ConnectionPrimitive>, PeerNegotiationError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PeerNegotiationError::Setup(format!("no tokio runtime: {}", e)))?;

        let user_id = config.events.user_id().to_owned();
        let (ops, rx) = mpsc::unbounded_channel();
        runtime.spawn(drive_peer(Arc::clone(&self.api), config, rx));

        Ok(Box::new(WebRtcPeer {
            user_id,
            ops,
            destroyed: false,
        }))
    }
}

struct WebRtcPeer {
    user_id: UserId,
    ops: mpsc::UnboundedSender<PeerOp>,
    destroyed: bool,
}

impl WebRtcPeer {
    fn queue(&self, op: PeerOp) -> Result<(), PeerNegotiationError> {
        self.ops
            .send(op)
            .map_err(|_| PeerNegotiationError::Gone(self.user_id.clone()))
    }
}

impl ConnectionPrimitive for WebRtcPeer {
    fn apply_remote_signal(&mut self, signal: Signal) -> Result<(), PeerNegotiationError> {
        self.queue(PeerOp::Signal(signal))
    }

    fn replace_outbound_track(
        &mut self,
        kind: TrackKind,
        track: LocalTrack,
    ) -> Result<(), PeerNegotiationError> {
        self.queue(PeerOp::ReplaceTrack(kind, track))
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let _ = self.ops.send(PeerOp::Destroy);
    }
}

async fn drive_peer(
    api: Arc<API>,
    config: PrimitiveConfig,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
) {
    let PrimitiveConfig {
        role,
        local_stream,
        rendezvous,
        events,
    } = config;

    let pc = match open(&api, &local_stream, &rendezvous, &events).await {
        Ok(pc) => pc,
        Err(e) => {
            events.emit(PrimitiveEvent::Error(e.to_string()));
            return;
        }
    };

    if role == NegotiationRole::Initiator {
        if let Err(e) = send_offer(&pc, &events).await {
            events.emit(PrimitiveEvent::Error(e.to_string()));
        }
    }

    while let Some(op) = ops.recv().await {
        match op {
            PeerOp::Signal(signal) => {
                if let Err(e) = apply_signal(&pc, signal, &events).await {
                    warn!(user_id = events.user_id(), error = %e, "failed to apply remote signal");
                }
            }
            PeerOp::ReplaceTrack(kind, track) => {
                if let Err(e) = replace_track(&pc, kind, track).await {
                    warn!(user_id = events.user_id(), error = %e, "failed to replace track");
                }
            }
            PeerOp::Destroy => break,
        }
    }

    if let Err(e) = pc.close().await {
        debug!(user_id = events.user_id(), error = %e, "error closing peer connection");
    }
}

async fn open(
    api: &API,
    local_stream: &LocalStream,
    rendezvous: &[RendezvousServer],
    events: &PeerEventSink,
) -> Result<Arc<RTCPeerConnection>, PeerNegotiationError> {
    let ice_servers = rendezvous
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
        PeerNegotiationError::Setup(format!("failed to create peer connection: {}", e))
    })?);

    for kind in local_stream.kinds() {
        let Some(track) = local_stream.track(kind) else {
            continue;
        };
        let rtp_track: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = pc.add_track(rtp_track).await.map_err(|e| {
            PeerNegotiationError::Setup(format!("failed to add {} track: {}", kind, e))
        })?;

        // Drain RTCP so interceptors (NACK, reports) keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(user_id = sink.user_id(), %state, "peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => sink.emit(PrimitiveEvent::Connect),
                RTCPeerConnectionState::Failed => {
                    sink.emit(PrimitiveEvent::Error("ICE/DTLS transport failed".to_owned()))
                }
                RTCPeerConnectionState::Closed => sink.emit(PrimitiveEvent::Close),
                _ => {}
            }
        })
    }));

    let sink = events.clone();
    let remote = Arc::new(Mutex::new(RemoteStream::default()));
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            let remote = Arc::clone(&remote);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let id = track.id().to_string();
                let stream_id = track.stream_id().to_string();
                info!(user_id = sink.user_id(), %kind, %id, "remote track");

                let mut stream = remote.lock().await;
                if stream.id.is_empty() {
                    stream.id = stream_id;
                }
                stream.tracks.push(RemoteTrack {
                    kind,
                    id,
                    handle: Some(track),
                });
                sink.emit(PrimitiveEvent::Stream(stream.clone()));
            })
        },
    ));

    Ok(pc)
}

/// Sets the local description and waits for ICE gathering, returning the SDP
/// with every candidate folded in.
async fn set_local_and_gather(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<String, PeerNegotiationError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(|e| PeerNegotiationError::Sdp(format!("failed to set local description: {}", e)))?;
    let _ = gathered.recv().await;

    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| PeerNegotiationError::Sdp("no local description after gathering".to_owned()))
}

async fn send_offer(
    pc: &RTCPeerConnection,
    events: &PeerEventSink,
) -> Result<(), PeerNegotiationError> {
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| PeerNegotiationError::Sdp(format!("failed to create offer: {}", e)))?;
    let sdp = set_local_and_gather(pc, offer).await?;
    events.emit(PrimitiveEvent::Signal(Signal::Offer { sdp }));
    Ok(())
}

async fn apply_signal(
    pc: &RTCPeerConnection,
    signal: Signal,
    events: &PeerEventSink,
) -> Result<(), PeerNegotiationError> {
    match signal {
        Signal::Offer { sdp } => {
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| PeerNegotiationError::Sdp(format!("invalid offer: {}", e)))?;
            pc.set_remote_description(offer).await.map_err(|e| {
                PeerNegotiationError::Sdp(format!("failed to set remote offer: {}", e))
            })?;
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| PeerNegotiationError::Sdp(format!("failed to create answer: {}", e)))?;
            let sdp = set_local_and_gather(pc, answer).await?;
            events.emit(PrimitiveEvent::Signal(Signal::Answer { sdp }));
        }
        Signal::Answer { sdp } => {
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| PeerNegotiationError::Sdp(format!("invalid answer: {}", e)))?;
            pc.set_remote_description(answer).await.map_err(|e| {
                PeerNegotiationError::Sdp(format!("failed to set remote answer: {}", e))
            })?;
        }
        Signal::Candidate { candidate } => {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            pc.add_ice_candidate(init)
                .await
                .map_err(|e| PeerNegotiationError::Ice(e.to_string()))?;
        }
    }
    Ok(())
}

async fn replace_track(
    pc: &RTCPeerConnection,
    kind: TrackKind,
    track: LocalTrack,
) -> Result<(), PeerNegotiationError> {
    let wanted = match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    };

    for sender in pc.get_senders().await {
        let Some(current) = sender.track().await else {
            continue;
        };
        if current.kind() != wanted {
            continue;
        }
        let replacement: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        return sender
            .replace_track(Some(replacement))
            .await
            .map_err(|e| PeerNegotiationError::Setup(format!("replace_track: {}", e)));
    }

    Err(PeerNegotiationError::NoSender(kind))
}
