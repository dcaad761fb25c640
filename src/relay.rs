//! WebSocket client for the relay.
//!
//! One background task owns the socket. Outbound frames are queued to it over an
//! mpsc channel; inbound frames are decoded and handed to the subscribers of their
//! event name, in arrival order. When the socket drops the task reconnects with
//! the same bounded backoff used for the first connect and re-joins the room.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::{ConnectionError, RelayError};
use crate::signaling::{OutboundEvent, RelayFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Anything that can put an outbound event on the relay.
pub trait SignalSender: Send + Sync {
    fn send(&self, event: OutboundEvent) -> Result<(), RelayError>;
}

/// Connection lifecycle, delivered to subscribers like any inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLifecycle {
    Disconnected,
    Reconnected,
    ReconnectFailed,
}

impl RelayLifecycle {
    pub const ALL: [RelayLifecycle; 3] = [
        RelayLifecycle::Disconnected,
        RelayLifecycle::Reconnected,
        RelayLifecycle::ReconnectFailed,
    ];

    pub const fn event_name(self) -> &'static str {
        match self {
            RelayLifecycle::Disconnected => "disconnected",
            RelayLifecycle::Reconnected => "reconnected",
            RelayLifecycle::ReconnectFailed => "reconnect-failed",
        }
    }
}

#[derive(Clone)]
struct Endpoint {
    url: String,
    credential: Option<String>,
}

impl Endpoint {
    fn request(&self) -> Result<Request, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidRequest {
            url: self.url.clone(),
            reason,
        };
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        if let Some(token) = &self.credential {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| invalid(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

#[derive(Default)]
struct Shared {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    connected: AtomicBool,
    room: Mutex<Option<String>>,
}

impl Shared {
    fn dispatch(&self, event: &str, data: &Value) {
        // Handlers run outside the lock so they may subscribe themselves.
        let handlers = self.handlers.read().get(event).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(event, "no subscriber for relay event");
        }
        for handler in handlers {
            handler(data);
        }
    }

    fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<RelayFrame>(text) {
            Ok(frame) => self.dispatch(&frame.event, &frame.data),
            Err(e) => warn!(error = %e, "dropping undecodable relay frame"),
        }
    }

    fn lifecycle(&self, event: RelayLifecycle) {
        self.dispatch(event.event_name(), &Value::Null);
    }
}

/// Handle to the relay connection. Clones share the same socket.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl RelayClient {
    /// Connects, retrying with exponential backoff up to
    /// `settings.max_reconnect_attempts` times.
    pub async fn connect(
        settings: &RelaySettings,
        credential: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let endpoint = Endpoint {
            url: settings.url.clone(),
            credential: credential.map(str::to_owned),
        };
        let ws = handshake(&endpoint, settings).await?;
        info!(url = %settings.url, "connected to relay");

        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            ws,
            rx,
            Arc::clone(&shared),
            endpoint,
            settings.clone(),
        ));

        Ok(Self { shared, outgoing })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Registers `handler` for every inbound event named `event`.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .entry(event.to_owned())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Sends an arbitrary named event. Fails locally when disconnected.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), RelayError> {
        let frame = RelayFrame {
            event: event.to_owned(),
            data,
        };
        let text = serde_json::to_string(&frame).map_err(|source| RelayError::Encode {
            event: event.to_owned(),
            source,
        })?;
        self.push(text)
    }

    pub fn join_room(&self, room_id: &str) -> Result<(), RelayError> {
        self.send(OutboundEvent::JoinRoom {
            room_id: room_id.to_owned(),
        })?;
        *self.shared.room.lock() = Some(room_id.to_owned());
        Ok(())
    }

    pub fn leave_room(&self) -> Result<(), RelayError> {
        let Some(room_id) = self.shared.room.lock().take() else {
            return Ok(());
        };
        self.send(OutboundEvent::LeaveRoom { room_id })
    }

    pub fn current_room(&self) -> Option<String> {
        self.shared.room.lock().clone()
    }

    /// Leaves the current room and shuts the connection down.
    pub fn close(&self) {
        if let Err(e) = self.leave_room() {
            debug!(error = %e, "leave-room not sent on close");
        }
        let _ = self.outgoing.send(Outgoing::Close);
    }

    fn push(&self, text: String) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.outgoing
            .send(Outgoing::Frame(text))
            .map_err(|_| RelayError::NotConnected)
    }
}

impl SignalSender for RelayClient {
    fn send(&self, event: OutboundEvent) -> Result<(), RelayError> {
        let text = serde_json::to_string(&event).map_err(|source| RelayError::Encode {
            event: event.name().to_owned(),
            source,
        })?;
        self.push(text)
    }
}

async fn handshake(
    endpoint: &Endpoint,
    settings: &RelaySettings,
) -> Result<WsStream, ConnectionError> {
    let attempts = settings.max_reconnect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect_async(endpoint.request()?).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) if attempt >= attempts => {
                return Err(ConnectionError::Exhausted { attempts, last: e });
            }
            Err(e) => {
                let delay = settings.backoff(attempt);
                warn!(attempt, ?delay, error = %e, "relay handshake failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn run_connection(
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    endpoint: Endpoint,
    settings: RelaySettings,
) {
    loop {
        let (mut write, mut read) = ws.split();
        let closed_locally = loop {
            tokio::select! {
                msg = outgoing.recv() => match msg {
                    Some(Outgoing::Frame(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "relay write failed");
                            break false;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break true;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => shared.dispatch_text(&text),
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "relay read failed");
                        break false;
                    }
                },
            }
        };

        shared.connected.store(false, Ordering::SeqCst);
        if closed_locally {
            info!("relay connection closed");
            return;
        }

        warn!("relay connection lost, reconnecting");
        shared.lifecycle(RelayLifecycle::Disconnected);

        ws = match reconnect(&shared, &endpoint, &settings).await {
            Some(ws) => ws,
            None => {
                shared.lifecycle(RelayLifecycle::ReconnectFailed);
                return;
            }
        };

        shared.connected.store(true, Ordering::SeqCst);
        info!("relay reconnected");
        shared.lifecycle(RelayLifecycle::Reconnected);
    }
}

/// Handshakes again and re-joins the current room. A socket that cannot take the
/// `join-room` frame counts as a failed attempt.
async fn reconnect(
    shared: &Shared,
    endpoint: &Endpoint,
    settings: &RelaySettings,
) -> Option<WsStream> {
    let attempts = settings.max_reconnect_attempts.max(1);
    for attempt in 1..=attempts {
        let mut ws = match handshake(endpoint, settings).await {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "relay reconnect failed");
                return None;
            }
        };

        let room = shared.room.lock().clone();
        let Some(room_id) = room else {
            return Some(ws);
        };
        let text = match serde_json::to_string(&OutboundEvent::JoinRoom {
            room_id: room_id.clone(),
        }) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode join-room");
                return Some(ws);
            }
        };
        match ws.send(Message::Text(text)).await {
            Ok(()) => return Some(ws),
            Err(e) => {
                let delay = settings.backoff(attempt);
                warn!(%room_id, attempt, ?delay, error = %e, "failed to re-join room, reconnecting");
                sleep(delay).await;
            }
        }
    }
    error!("relay re-join failed on every attempt");
    None
}
