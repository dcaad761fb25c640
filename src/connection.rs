use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::room::state::RoomView;

/// Health of one peer connection as shown to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Publishes the room view to any number of observers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<RoomView>>,
    receiver: watch::Receiver<RoomView>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(RoomView::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Observers are only woken when the view actually changed.
    pub fn publish(&self, view: RoomView) {
        self.status.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    pub fn current(&self) -> RoomView {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
