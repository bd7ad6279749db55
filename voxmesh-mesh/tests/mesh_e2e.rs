//! Multi-participant scenarios over the in-memory backend and the simulated
//! transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use voxmesh_core::models::{ChannelId, ParticipantId, RelayStatus, Scope, SignalKind, TrackKind};
use voxmesh_core::{Config, SyntheticDevices};
use voxmesh_mesh::{
    Collaborators, ConnectionState, NegotiationState, SessionCoordinator, SessionEvent, SessionState,
    SimulatedTransportFactory,
};
use voxmesh_relay::{InMemoryBackend, PresenceTracker};

struct Mesh {
    backend: InMemoryBackend,
    transports: Arc<SimulatedTransportFactory>,
    config: Config,
}

impl Mesh {
    fn new() -> Self {
        let mut config = Config::default();
        config.mesh.session_settle_delay_ms = 10;
        Self {
            backend: InMemoryBackend::new(),
            transports: Arc::new(SimulatedTransportFactory::new()),
            config,
        }
    }

    async fn peer(&self, id: &str) -> Arc<SessionCoordinator> {
        let coordinator = SessionCoordinator::new(
            ParticipantId::from(id),
            &self.config,
            Collaborators {
                store: Arc::new(self.backend.clone()),
                relay: Arc::new(self.backend.clone()),
                devices: Arc::new(SyntheticDevices::new()),
                transports: self.transports.clone(),
            },
        );
        coordinator.start().await.unwrap();
        coordinator
    }

    fn offers_from(&self, from: &str) -> usize {
        self.backend
            .sent_signals()
            .iter()
            .filter(|s| s.from.as_str() == from && s.kind() == SignalKind::Offer)
            .count()
    }

    fn answers_from(&self, from: &str) -> usize {
        self.backend
            .sent_signals()
            .iter()
            .filter(|s| s.from.as_str() == from && s.kind() == SignalKind::Answer)
            .count()
    }

    /// Transports towards `to` that are still open
    fn open_transports(&self, to: &str) -> usize {
        self.transports
            .transports_to(&ParticipantId::from(to))
            .iter()
            .filter(|t| !t.is_closed())
            .count()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Both sides hold a connected, settled link to each other and the links
/// name each other
fn paired(x: &SessionCoordinator, y: &SessionCoordinator) -> bool {
    let (Some(xy), Some(yx)) = (x.link_to(y.local_id()), y.link_to(x.local_id())) else {
        return false;
    };
    xy.connection_state() == ConnectionState::Connected
        && yx.connection_state() == ConnectionState::Connected
        && xy.negotiation_state() == NegotiationState::Stable
        && yx.negotiation_state() == NegotiationState::Stable
        && xy.remote_link_id().as_ref() == Some(yx.id())
        && yx.remote_link_id().as_ref() == Some(xy.id())
}

async fn connected(x: &SessionCoordinator, y: &SessionCoordinator) {
    eventually(|| paired(x, y)).await;
}

fn collect(rx: &mut broadcast::Receiver<SessionEvent>, into: &mut Vec<SessionEvent>) {
    while let Ok(event) = rx.try_recv() {
        into.push(event);
    }
}

#[tokio::test]
async fn test_two_peers_connect() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;

    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;

    // Only the later joiner offers
    assert_eq!(mesh.offers_from("a"), 0);
    assert_eq!(mesh.offers_from("b"), 1);
    assert_eq!(mesh.answers_from("a"), 1);

    let ab = a.link_to(&ParticipantId::from("b")).unwrap();
    assert_eq!(Some(ab.remote_epoch()), b.local_epoch());
    assert_eq!(ab.remote_tracks(), vec![TrackKind::Voice]);
    eventually(|| a.participants().len() == 1 && b.participants().len() == 1).await;
}

#[tokio::test]
async fn test_three_way_mesh() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;
    let c = mesh.peer("c").await;

    a.join_channel(ChannelId::from("7")).await.unwrap();
    b.join_channel(ChannelId::from("7")).await.unwrap();
    c.join_channel(ChannelId::from("7")).await.unwrap();

    connected(&a, &b).await;
    connected(&a, &c).await;
    connected(&b, &c).await;

    for peer in [&a, &b, &c] {
        assert_eq!(peer.link_count(), 2);
    }
    assert_eq!(mesh.offers_from("a"), 0);
    assert_eq!(mesh.offers_from("b"), 1);
    assert_eq!(mesh.offers_from("c"), 2);
}

#[tokio::test]
async fn test_rejoin_leaves_single_link() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;

    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;
    let first = a.link_to(&ParticipantId::from("b")).unwrap();

    b.leave().await;
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;

    let second = a.link_to(&ParticipantId::from("b")).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_closed());
    assert_eq!(Some(second.remote_epoch()), b.local_epoch());
    assert_eq!(a.link_count(), 1);
    eventually(|| mesh.open_transports("b") == 1).await;
}

#[tokio::test]
async fn test_simultaneous_renegotiation_converges() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;
    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;

    // Both offers cross on the wire
    mesh.backend.hold_signals();
    let (on_a, on_b) = tokio::join!(a.toggle_camera(), b.toggle_camera());
    assert!(on_a.unwrap());
    assert!(on_b.unwrap());
    assert!(mesh.backend.release_signals() >= 2);

    connected(&a, &b).await;
    let ab = a.link_to(&ParticipantId::from("b")).unwrap();
    let ba = b.link_to(&ParticipantId::from("a")).unwrap();
    eventually(|| ab.remote_tracks().contains(&TrackKind::Camera)).await;
    eventually(|| ba.remote_tracks().contains(&TrackKind::Camera)).await;
    assert_eq!(a.link_count(), 1);
    assert_eq!(b.link_count(), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_is_harmless() {
    let mesh = Mesh::new();
    mesh.backend.set_duplicate_delivery(true);
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;

    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(mesh.answers_from("a"), 1);
    assert_eq!(a.link_count(), 1);
    assert_eq!(b.link_count(), 1);
    assert_eq!(mesh.transports.created_count(), 2);
}

#[tokio::test]
async fn test_camera_reaches_remote_peer() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;
    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;

    let mut rx = a.subscribe();
    let mut events = Vec::new();
    assert!(b.toggle_camera().await.unwrap());

    eventually(|| {
        collect(&mut rx, &mut events);
        events.iter().any(|e| {
            matches!(e, SessionEvent::RemoteTrackAdded { participant_id, kind: TrackKind::Camera, .. }
                if participant_id.as_str() == "b")
        })
    })
    .await;
    eventually(|| {
        a.participants()
            .iter()
            .any(|p| p.participant_id.as_str() == "b" && p.flags.video)
    })
    .await;

    assert!(!b.toggle_camera().await.unwrap());
    eventually(|| {
        collect(&mut rx, &mut events);
        events.iter().any(|e| {
            matches!(e, SessionEvent::RemoteTrackRemoved { participant_id, kind: TrackKind::Camera }
                if participant_id.as_str() == "b")
        })
    })
    .await;
}

#[tokio::test]
async fn test_leave_closes_remote_link() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let b = mesh.peer("b").await;
    a.join_channel(ChannelId::from("42")).await.unwrap();
    b.join_channel(ChannelId::from("42")).await.unwrap();
    connected(&a, &b).await;
    let link = a.link_to(&ParticipantId::from("b")).unwrap();

    let mut rx = a.subscribe();
    let mut events = Vec::new();
    b.leave().await;

    eventually(|| a.link_to(&ParticipantId::from("b")).is_none()).await;
    assert!(link.is_closed());
    eventually(|| {
        collect(&mut rx, &mut events);
        events.contains(&SessionEvent::ParticipantLeft {
            participant_id: ParticipantId::from("b"),
        })
    })
    .await;
    assert_eq!(a.state(), SessionState::Active);
    assert!(a.participants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_relay_outage_past_grace_forces_leave() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let tracker = PresenceTracker::new(
        ParticipantId::from("a"),
        Arc::new(mesh.backend.clone()),
        mesh.config.presence.clone(),
    );
    tracker.start().await.unwrap();
    a.attach_presence(&tracker);
    a.join_channel(ChannelId::from("42")).await.unwrap();

    let mut rx = a.subscribe();
    let mut events = Vec::new();
    mesh.backend.set_relay_status(RelayStatus::ChannelError);
    tokio::time::sleep(mesh.config.presence.grace_period() + Duration::from_secs(1)).await;

    eventually(|| a.state() == SessionState::Idle).await;
    assert_eq!(tracker.forced_leave_count(), 1);
    collect(&mut rx, &mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionLost { .. })));
    assert!(mesh.backend.members(&Scope::Channel(ChannelId::from("42"))).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_relay_recovery_within_grace_keeps_session() {
    let mesh = Mesh::new();
    let a = mesh.peer("a").await;
    let tracker = PresenceTracker::new(
        ParticipantId::from("a"),
        Arc::new(mesh.backend.clone()),
        mesh.config.presence.clone(),
    );
    tracker.start().await.unwrap();
    a.attach_presence(&tracker);
    a.join_channel(ChannelId::from("42")).await.unwrap();

    mesh.backend.set_relay_status(RelayStatus::ChannelError);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(tracker.grace_pending());
    mesh.backend.set_relay_status(RelayStatus::Subscribed);
    tokio::time::sleep(mesh.config.presence.grace_period() * 2).await;

    assert_eq!(a.state(), SessionState::Active);
    assert_eq!(tracker.forced_leave_count(), 0);
    assert!(!tracker.grace_pending());
}
