//! Peer-to-peer mesh negotiation for multi-party rooms.
//!
//! Participants discover each other through a relay and then connect directly,
//! one WebRTC peer connection per pair. [`room::NegotiationController`] decides who
//! initiates, routes offers, answers and candidates to the right
//! [`room::PeerSession`], and tears sessions down when peers leave.

pub mod audio;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod peer_connection;
pub mod primitive;
pub mod relay;
pub mod room;
pub mod signaling;

pub use client::RoomClient;
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use relay::{RelayClient, SignalSender};
pub use room::{ControllerHandle, NegotiationController, RoomView};
