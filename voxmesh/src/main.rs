use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use voxmesh_core::models::{ChannelId, ParticipantId};
use voxmesh_core::{logging, Config, SyntheticDevices};
use voxmesh_mesh::{
    Collaborators, ConnectionState, PeerTransportFactory, SessionCoordinator, SessionEvent,
    SimulatedTransportFactory, WebRtcTransportFactory,
};
use voxmesh_relay::{InMemoryBackend, PresenceTracker};

#[derive(Parser, Debug)]
#[command(name = "voxmesh")]
#[command(about = "Full-mesh voice/video session coordinator", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "VOXMESH_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process mesh of simulated participants
    Demo {
        /// Number of participants
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Channel every participant joins
        #[arg(long, default_value = "lobby")]
        channel: String,

        /// Media stack under each peer link
        #[arg(long, value_enum, default_value_t = TransportKind::Simulated)]
        transport: TransportKind,

        /// Stay in the session until Ctrl-C instead of leaving once connected
        #[arg(long)]
        hold: bool,

        /// Give up waiting for the mesh to connect after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransportKind {
    Simulated,
    Webrtc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo {
            participants,
            channel,
            transport,
            hold,
            timeout_secs,
        } => {
            logging::init_logging(&config.logging)?;
            run_demo(&config, participants, &channel, transport, hold, Duration::from_secs(timeout_secs)).await
        }
    }
}

struct DemoPeer {
    coordinator: Arc<SessionCoordinator>,
    presence: Arc<PresenceTracker>,
}

async fn spawn_peer(
    id: ParticipantId,
    config: &Config,
    backend: &InMemoryBackend,
    transports: Arc<dyn PeerTransportFactory>,
) -> Result<DemoPeer> {
    let coordinator = SessionCoordinator::new(
        id.clone(),
        config,
        Collaborators {
            store: Arc::new(backend.clone()),
            relay: Arc::new(backend.clone()),
            devices: Arc::new(SyntheticDevices::new()),
            transports,
        },
    );
    coordinator.start().await?;

    let presence = PresenceTracker::new(id, Arc::new(backend.clone()), config.presence.clone());
    presence.start().await?;
    coordinator.attach_presence(&presence);

    Ok(DemoPeer { coordinator, presence })
}

fn log_events(peer: &SessionCoordinator) {
    let mut rx = peer.subscribe();
    let local = peer.local_id().clone();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                SessionEvent::PeerConnected { participant_id, link_id } => {
                    info!(%local, remote = %participant_id, %link_id, "Peer connected");
                }
                SessionEvent::RemoteTrackAdded { participant_id, kind, .. } => {
                    info!(%local, remote = %participant_id, %kind, "Remote track added");
                }
                SessionEvent::LinkFailed { participant_id, .. } => {
                    warn!(%local, remote = %participant_id, "Link failed");
                }
                SessionEvent::MediaError { kind, message } => {
                    warn!(%local, %kind, error = %message, "Media error");
                }
                _ => {}
            }
        }
    });
}

/// Every participant holds a connected link to every other one
fn fully_connected(peers: &[DemoPeer]) -> bool {
    let expected = peers.len().saturating_sub(1);
    peers.iter().all(|peer| {
        let links = peer.coordinator.links();
        links.len() == expected
            && links
                .iter()
                .all(|link| link.connection_state() == ConnectionState::Connected)
    })
}

async fn run_demo(
    config: &Config,
    participants: usize,
    channel: &str,
    transport: TransportKind,
    hold: bool,
    timeout: Duration,
) -> Result<()> {
    let backend = InMemoryBackend::new();
    let transports: Arc<dyn PeerTransportFactory> = match transport {
        TransportKind::Simulated => Arc::new(SimulatedTransportFactory::new()),
        TransportKind::Webrtc => Arc::new(WebRtcTransportFactory::new(&config.mesh)?),
    };
    info!(participants, channel, ?transport, "Starting demo mesh");

    let mut peers = Vec::with_capacity(participants);
    for i in 1..=participants {
        let peer = spawn_peer(ParticipantId::from(format!("peer-{i}")), config, &backend, transports.clone()).await?;
        log_events(&peer.coordinator);
        peers.push(peer);
    }

    // Join one after another so each newcomer offers to everyone already there
    for peer in &peers {
        peer.coordinator.join_channel(ChannelId::from(channel)).await?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while !fully_connected(&peers) {
        if tokio::time::Instant::now() >= deadline {
            error!("Mesh did not connect within {}s", timeout.as_secs());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let Some(first) = peers.first() {
        if let Err(e) = first.coordinator.toggle_camera().await {
            warn!(error = %e, "Camera toggle failed");
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for peer in &peers {
        let summary = serde_json::json!({
            "participant": peer.coordinator.local_id(),
            "state": peer.coordinator.state(),
            "epoch": peer.coordinator.local_epoch(),
            "presence": peer.presence.local_status(),
            "remotes": peer.coordinator.participants(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if hold {
        info!("Holding the session, press Ctrl-C to leave");
        tokio::signal::ctrl_c().await?;
    }

    join_all(peers.iter().map(|peer| async move {
        peer.coordinator.shutdown().await;
        peer.presence.shutdown().await;
    }))
    .await;
    info!("Demo finished");
    Ok(())
}
