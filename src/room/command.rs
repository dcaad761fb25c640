//! Typed commands consumed by the controller's event loop.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::media::LocalStream;
use crate::primitive::PrimitiveEvent;
use crate::relay::{RelayClient, RelayLifecycle};
use crate::signaling::{InboundEvent, Participant, UserId};

#[derive(Debug)]
pub enum Command {
    /// Seed outbound sessions from the room snapshot.
    Initialize {
        members: Vec<Participant>,
        local_stream: LocalStream,
    },
    /// Local stream to use when `room-joined` arrives.
    StageLocalStream(LocalStream),
    Relay(InboundEvent),
    Lifecycle(RelayLifecycle),
    Peer {
        user_id: UserId,
        generation: u64,
        event: PrimitiveEvent,
    },
    UpdateLocalStream(LocalStream),
    ToggleAudio(bool),
    ToggleVideo(bool),
    StartScreenShare(LocalStream),
    StopScreenShare,
    Cleanup,
    /// Clean up and stop the event loop.
    Shutdown,
}

/// Subscribes to every relay event the controller understands and forwards each
/// one, decoded, as a [`Command`].
pub fn bridge_relay(relay: &RelayClient, commands: &mpsc::UnboundedSender<Command>) {
    for &name in InboundEvent::NAMES {
        let tx = commands.clone();
        relay.subscribe(name, move |data| match InboundEvent::decode(name, data) {
            Ok(event) => {
                if tx.send(Command::Relay(event)).is_err() {
                    debug!(event = name, "controller stopped, dropping relay event");
                }
            }
            Err(e) => warn!(error = %e, "dropping relay event"),
        });
    }

    for lifecycle in RelayLifecycle::ALL {
        let tx = commands.clone();
        relay.subscribe(lifecycle.event_name(), move |_| {
            let _ = tx.send(Command::Lifecycle(lifecycle));
        });
    }
}
