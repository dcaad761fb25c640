//! Local and remote media streams, and the port used to acquire local media.
//!
//! Streams here are thin handles: a `LocalTrack` wraps the webrtc-rs sample track
//! that a capture source writes into, a `RemoteTrack` wraps the track received from
//! a peer. Capture itself lives behind [`LocalMediaPort`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaAccessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Which kinds of media to request from a [`LocalMediaPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// One outbound track. Clones share the same underlying track and enabled flag.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// PCMU (G.711 µ-law, 8 kHz mono) audio track.
    pub fn audio(id: &str, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self::new(TrackKind::Audio, Arc::new(track))
    }

    /// VP8 video track.
    pub fn video(id: &str, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self::new(TrackKind::Video, Arc::new(track))
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Disabled tracks stay attached; their source writes silence or nothing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The local outbound stream, shared read-only by every peer session.
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    guard: Option<Arc<dyn Any + Send + Sync>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            guard: None,
        }
    }

    /// Keeps `guard` (typically a running capture) alive as long as any clone of
    /// the stream exists.
    pub fn with_guard(mut self, guard: Arc<dyn Any + Send + Sync>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Distinct track kinds, in track order.
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        for track in &self.tracks {
            if !kinds.contains(&track.kind) {
                kinds.push(track.kind);
            }
        }
        kinds
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
    }

    /// A copy of this stream whose tracks of `track.kind()` are replaced by `track`.
    pub fn with_track(&self, track: LocalTrack) -> Self {
        let mut tracks: Vec<LocalTrack> = self
            .tracks
            .iter()
            .filter(|t| t.kind != track.kind)
            .cloned()
            .collect();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            tracks,
            guard: self.guard.clone(),
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    /// `None` for tracks that did not come from a webrtc-rs peer connection.
    pub handle: Option<Arc<TrackRemote>>,
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Media received from one remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Capability used to obtain local outbound media.
#[async_trait]
pub trait LocalMediaPort: Send + Sync {
    async fn get_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;

    async fn get_display_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}
