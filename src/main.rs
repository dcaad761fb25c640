use anyhow::{Context, Result};
use clap::Parser;
use mesh_room::audio::CpalMediaPort;
use mesh_room::peer_connection::WebRtcFactory;
use mesh_room::room::ControllerPhase;
use mesh_room::{ClientConfig, RoomClient};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Joins a room on the relay and keeps a direct audio connection to every
/// other participant until interrupted.
#[derive(Parser, Debug)]
#[command(name = "mesh-room-client", version)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL, overrides the configuration file.
    #[arg(long, env = "MESH_RELAY_URL")]
    relay_url: Option<String>,

    #[arg(long, default_value = "test-room")]
    room: String,

    /// Identity announced to peers. Random when omitted. With a token it must be
    /// the identity the relay assigns to that token.
    #[arg(long)]
    user_id: Option<String>,

    /// Bearer token for the relay.
    #[arg(long, env = "MESH_RELAY_TOKEN", requires = "user_id")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = args.relay_url {
        config.relay.url = url;
    }
    let user_id = args
        .user_id
        .unwrap_or_else(|| format!("user-{}", rand::random::<u32>()));

    let media = CpalMediaPort::new(format!("{}-local", user_id));
    let client = RoomClient::join(
        &config,
        user_id,
        args.token.as_deref(),
        &media,
        Box::new(WebRtcFactory::new()?),
        &args.room,
    )
    .await
    .context("failed to join room")?;

    let mut view = client.handle().subscribe();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let result = loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = view.borrow().clone();
                if current.phase == ControllerPhase::TornDown {
                    break Err(anyhow::anyhow!("relay connection lost"));
                }
                info!(
                    peers = current.peers.len(),
                    connected = current.connected_count(),
                    "room updated"
                );
                for peer in &current.peers {
                    info!(
                        user_id = %peer.user_id,
                        name = %peer.display_name,
                        state = %peer.state,
                        audio = peer.audio_enabled,
                        "peer"
                    );
                }
            }
            _ = &mut interrupted => {
                info!("leaving room");
                break Ok(());
            }
        }
    };

    client.leave().await;
    result
}
