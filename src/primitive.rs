//! Contract for the point-to-point connection primitive.
//!
//! A primitive is told whether to initiate or respond, is handed the local stream
//! and the rendezvous servers, and from then on talks to the controller only
//! through [`PeerEventSink`].

use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::RendezvousServer;
use crate::error::PeerNegotiationError;
use crate::media::{LocalStream, LocalTrack, RemoteStream, TrackKind};
use crate::room::command::Command;
use crate::signaling::{Signal, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationRole::Initiator => write!(f, "initiator"),
            NegotiationRole::Responder => write!(f, "responder"),
        }
    }
}

/// Everything a primitive can report.
#[derive(Debug, Clone)]
pub enum PrimitiveEvent {
    Signal(Signal),
    Stream(RemoteStream),
    Connect,
    Error(String),
    Close,
}

/// Routes a primitive's events back into the controller, tagged with the owning
/// session so late events from a destroyed session can be told apart.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    user_id: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl PeerEventSink {
    pub fn new(user_id: UserId, generation: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            user_id,
            generation,
            tx,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PrimitiveEvent) {
        let command = Command::Peer {
            user_id: self.user_id.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(command).is_err() {
            debug!(user_id = %self.user_id, "controller gone, dropping primitive event");
        }
    }
}

pub struct PrimitiveConfig {
    pub role: NegotiationRole,
    pub local_stream: LocalStream,
    pub rendezvous: Vec<RendezvousServer>,
    pub events: PeerEventSink,
}

/// A live point-to-point connection.
///
/// Calls never block: implementations queue work and report results through
/// their [`PeerEventSink`].
pub trait ConnectionPrimitive: Send {
    fn apply_remote_signal(&mut self, signal: Signal) -> Result<(), PeerNegotiationError>;

    fn replace_outbound_track(
        &mut self,
        kind: TrackKind,
        track: LocalTrack,
    ) -> Result<(), PeerNegotiationError>;

    /// Releases every resource. Calling it more than once has no further effect.
    fn destroy(&mut self);
}

pub trait PrimitiveFactory: Send {
    fn create(
        &self,
        config: PrimitiveConfig,
    ) -> Result<Box<dyn ConnectionPrimitive>, PeerNegotiationError>;
}
