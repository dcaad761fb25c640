//! Room-level negotiation: the controller, its registry of peer sessions, and the
//! commands that drive it.

pub mod command;
pub mod controller;
pub mod registry;
pub mod session;
pub mod state;

pub use command::{bridge_relay, Command};
pub use controller::{ControllerHandle, ControllerSettings, NegotiationController};
pub use registry::PeerRegistry;
pub use session::PeerSession;
pub use state::{ControllerPhase, PeerSummary, RoomView};
