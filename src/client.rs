//! One room membership: local media, the relay connection and a running
//! controller, started in the order the relay expects.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::media::LocalMediaPort;
use crate::primitive::PrimitiveFactory;
use crate::relay::RelayClient;
use crate::room::{bridge_relay, ControllerHandle, ControllerSettings, NegotiationController};
use crate::signaling::UserId;

pub struct RoomClient {
    user_id: UserId,
    relay: RelayClient,
    handle: ControllerHandle,
    task: JoinHandle<()>,
}

impl RoomClient {
    /// Acquires local media, connects to the relay and sends `join-room`.
    /// Sessions open once the relay answers with `room-joined`.
    ///
    /// `user_id` must be the identity the relay derives from `credential`,
    /// otherwise the room snapshot will list us under a name we do not skip.
    pub async fn join(
        config: &ClientConfig,
        user_id: impl Into<UserId>,
        credential: Option<&str>,
        media: &dyn LocalMediaPort,
        factory: Box<dyn PrimitiveFactory>,
        room_id: &str,
    ) -> Result<Self> {
        let user_id = user_id.into();
        let local_stream = media.get_local_media(&config.media).await?;
        let relay = RelayClient::connect(&config.relay, credential).await?;

        let settings = ControllerSettings {
            rendezvous: config.rendezvous.servers.clone(),
            failure_policy: config.negotiation.failure_policy,
        };
        let (controller, commands) = NegotiationController::new(
            user_id.clone(),
            settings,
            factory,
            Arc::new(relay.clone()),
        );
        let handle = controller.handle();
        bridge_relay(&relay, handle.sender());
        handle.stage_local_stream(local_stream);
        let task = controller.spawn(commands);

        if let Err(e) = relay.join_room(room_id) {
            handle.shutdown();
            relay.close();
            return Err(e.into());
        }
        info!(%user_id, %room_id, "joining room");

        Ok(Self {
            user_id,
            relay,
            handle,
            task,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    /// Tears every session down, leaves the room and waits for the controller.
    pub async fn leave(self) {
        self.handle.shutdown();
        self.relay.close();
        if let Err(e) = self.task.await {
            warn!(error = %e, "controller task ended abnormally");
        }
    }
}
