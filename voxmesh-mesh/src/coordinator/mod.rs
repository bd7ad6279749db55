//! Session coordinator
//!
//! Owns the local voice session: membership, one [`PeerLink`] per remote
//! participant, the local sources and the inbound signal lanes.
//!
//! Every join or leave bumps an intent version. Long-running work (peer
//! connects, reconciliation, inbound negotiation) captures the version when
//! it starts and re-checks it after each await, so work begun for a session
//! that has since been left never touches the state of the next one.
//! Transitions themselves are serialized by a single async lock; inbound
//! signals never take that lock.

mod media;
mod reconcile;
mod signaling;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxmesh_core::backend::{MediaDevices, MembershipStore, SignalRelay};
use voxmesh_core::config::MeshConfig;
use voxmesh_core::models::{
    CallId, ChannelId, Epoch, IceCandidate, LinkId, MemberFlags, Membership, ParticipantId, Scope,
    Signal, TrackKind,
};
use voxmesh_core::{Config, Error, LocalTrack, Result};
use voxmesh_relay::{PresenceTracker, SessionControl, SignalRelayClient};

use crate::events::{RemoteParticipant, SessionEvent, SessionState};
use crate::link::PeerLink;
use crate::multiplexer::TrackMultiplexer;
use crate::transport::PeerTransportFactory;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Backends the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MembershipStore>,
    pub relay: Arc<dyn SignalRelay>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    scope: Option<Scope>,
    epoch: Option<Epoch>,
    /// Epoch of the most recent join, kept across leaves
    last_epoch: Option<Epoch>,
    muted: bool,
    deafened: bool,
    noise_suppression: bool,
    audio_device: Option<String>,
    video_device: Option<String>,
    /// Cancels the watchers and tickers of the current session
    tasks: Option<CancellationToken>,
}

/// Snapshot of a joining or active session
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub scope: Scope,
    pub intent: u64,
}

pub struct SessionCoordinator {
    local: ParticipantId,
    mesh: MeshConfig,
    store: Arc<dyn MembershipStore>,
    signals: SignalRelayClient,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn PeerTransportFactory>,

    intent: AtomicU64,
    transition: Mutex<()>,
    session: RwLock<Session>,

    links: DashMap<ParticipantId, Arc<PeerLink>>,
    participants: DashMap<ParticipantId, Membership>,
    lanes: DashMap<ParticipantId, mpsc::UnboundedSender<Signal>>,
    /// Candidates that arrived before any link to their sender existed
    early_candidates: DashMap<ParticipantId, Vec<(LinkId, IceCandidate)>>,
    /// Remote link ids of links we tore down; their late signals are stale
    retired_links: DashMap<ParticipantId, Vec<LinkId>>,
    /// Participants whose link failed and should be reconnected
    recovering: DashSet<ParticipantId>,

    tracks: TrackMultiplexer,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    weak_self: Weak<Self>,
}

impl SessionCoordinator {
    pub fn new(local: ParticipantId, config: &Config, deps: Collaborators) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            signals: SignalRelayClient::new(deps.relay, config.relay.clone()),
            local,
            mesh: config.mesh.clone(),
            store: deps.store,
            devices: deps.devices,
            transports: deps.transports,
            intent: AtomicU64::new(0),
            transition: Mutex::new(()),
            session: RwLock::new(Session {
                noise_suppression: config.media.noise_suppression,
                audio_device: config.media.audio_input_device.clone(),
                video_device: config.media.video_input_device.clone(),
                ..Session::default()
            }),
            links: DashMap::new(),
            participants: DashMap::new(),
            lanes: DashMap::new(),
            early_candidates: DashMap::new(),
            retired_links: DashMap::new(),
            recovering: DashSet::new(),
            tracks: TrackMultiplexer::new(),
            events,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        })
    }

    /// Subscribe to inbound signals. Each sender gets its own ordered lane.
    pub async fn start(&self) -> Result<()> {
        let mut inbound = self.signals.subscribe(&self.local).await?;
        let weak = self.weak_self.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    () = shutdown.cancelled() => break,
                    signal = inbound.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else { break };
                this.route_signal(signal);
            }
            debug!("Signal router stopped");
        });

        info!(participant = %self.local, "Session coordinator started");
        Ok(())
    }

    /// Let `tracker` force-leave this coordinator after a relay outage
    pub fn attach_presence(self: &Arc<Self>, tracker: &PresenceTracker) {
        let control: Weak<dyn SessionControl> = Arc::downgrade(self) as Weak<dyn SessionControl>;
        tracker.set_session_control(control);
    }

    /// Leave any session and stop background work
    pub async fn shutdown(&self) {
        self.leave().await;
        self.shutdown.cancel();
        self.signals.shutdown();
        self.lanes.clear();
        info!(participant = %self.local, "Session coordinator stopped");
    }

    pub async fn join_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.join(Scope::Channel(channel_id)).await
    }

    pub async fn join_call(&self, call_id: CallId) -> Result<()> {
        self.join(Scope::Call(call_id)).await
    }

    /// Join `scope`, leaving any other session first. Joining the active
    /// scope again is a no-op.
    pub async fn join(&self, scope: Scope) -> Result<()> {
        let guard = self.transition.lock().await;

        let current = self.session.read().scope.clone();
        if let Some(current) = current {
            if current == scope {
                debug!(%scope, "Already in session");
                return Ok(());
            }
            info!(from = %current, to = %scope, "Switching session");
            self.leave_locked().await;
            if current.kind() != scope.kind() {
                // Capture devices of the torn-down session need a moment to be released
                tokio::time::sleep(self.mesh.settle_delay()).await;
            }
        }

        let intent = self.bump_intent();
        let tasks = self.shutdown.child_token();
        let (epoch, device, noise_suppression, muted, deafened) = {
            let mut session = self.session.write();
            let epoch = Epoch::next_after(session.last_epoch);
            session.state = SessionState::Joining;
            session.scope = Some(scope.clone());
            session.epoch = Some(epoch);
            session.last_epoch = Some(epoch);
            session.tasks = Some(tasks.clone());
            (
                epoch,
                session.audio_device.clone(),
                session.noise_suppression,
                session.muted,
                session.deafened,
            )
        };
        self.emit_state();
        info!(%scope, %epoch, "Joining session");

        let voice = match self
            .devices
            .acquire_audio_input(device.as_deref(), noise_suppression)
            .await
        {
            Ok(track) => track,
            Err(e) => {
                self.abort_join(&scope, &e, false).await;
                return Err(e);
            }
        };
        self.tracks.set(voice.clone());
        self.tracks.apply_voice_gate(muted, deafened);
        self.watch_track(&voice);
        // Links accepted from inbound offers while joining have no voice yet
        let results = self.tracks.broadcast_attach(TrackKind::Voice, &self.links()).await;
        self.renegotiate_changed(results, intent).await;
        self.emit(SessionEvent::LocalTrackChanged {
            kind: TrackKind::Voice,
            active: true,
        });

        let membership = Membership::new(scope.clone(), self.local.clone(), epoch, self.member_flags());
        if let Err(e) = self.store.insert_membership(membership).await {
            self.abort_join(&scope, &e, false).await;
            return Err(e);
        }

        self.spawn_membership_watcher(&scope, intent, &tasks).await;

        let members = match self.store.list_memberships(&scope).await {
            Ok(members) => members,
            Err(e) => {
                self.abort_join(&scope, &e, true).await;
                return Err(e);
            }
        };

        self.session.write().state = SessionState::Active;
        self.emit_state();
        self.spawn_reconcile_ticker(intent, &tasks);

        let peers: Vec<Membership> = members
            .into_iter()
            .filter(|m| m.scope == scope && m.participant_id != self.local)
            .collect();
        for member in &peers {
            self.record_participant(member);
        }
        info!(%scope, peers = peers.len(), "Joined session");
        drop(guard);

        join_all(peers.into_iter().map(|member| self.connect_to(member, intent))).await;
        Ok(())
    }

    /// Undo a join that failed half way and report it
    async fn abort_join(&self, scope: &Scope, error: &Error, inserted: bool) {
        warn!(%scope, error = %error, "Join failed");
        self.bump_intent();

        let tasks = self.session.write().tasks.take();
        if let Some(tasks) = tasks {
            tasks.cancel();
        }
        self.tracks.stop_all();

        if inserted {
            if let Err(e) = self.store.delete_membership(scope, &self.local).await {
                warn!(%scope, error = %e, "Failed to remove membership of aborted join");
            }
        }

        {
            let mut session = self.session.write();
            session.state = SessionState::Idle;
            session.scope = None;
            session.epoch = None;
        }
        self.report_media_error(error);
        self.emit_state();
    }

    /// Leave the active session of either kind. Idempotent.
    pub async fn leave(&self) {
        let _guard = self.transition.lock().await;
        self.leave_locked().await;
    }

    /// Leave the active session if it is a voice channel
    pub async fn leave_channel(&self) {
        let _guard = self.transition.lock().await;
        if self.session.read().scope.as_ref().is_some_and(Scope::is_channel) {
            self.leave_locked().await;
        }
    }

    /// Leave the active session if it is a call
    pub async fn leave_call(&self) {
        let _guard = self.transition.lock().await;
        if self.session.read().scope.as_ref().is_some_and(Scope::is_call) {
            self.leave_locked().await;
        }
    }

    /// Tear down the session after the relay stayed unreachable
    pub async fn force_leave(&self, reason: &str) {
        let _guard = self.transition.lock().await;
        let had_session = self.session.read().scope.is_some();
        self.leave_locked().await;
        warn!(reason, had_session, "Forced leave");
        self.emit(SessionEvent::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    /// Must be called with the transition lock held
    async fn leave_locked(&self) {
        let (scope, tasks) = {
            let mut session = self.session.write();
            let Some(scope) = session.scope.clone() else {
                return;
            };
            session.state = SessionState::Leaving;
            (scope, session.tasks.take())
        };
        self.emit_state();
        info!(%scope, "Leaving session");

        if let Some(tasks) = tasks {
            tasks.cancel();
        }

        // Peers are told about the screen share ending while links are still up
        let intent = self.current_intent();
        self.remove_source(TrackKind::Screen, intent, true).await;

        self.bump_intent();
        self.remove_source(TrackKind::Camera, intent, false).await;
        for kind in self.tracks.active_kinds() {
            self.emit(SessionEvent::LocalTrackChanged { kind, active: false });
        }
        self.tracks.stop_all();

        let remotes: Vec<ParticipantId> = self.links.iter().map(|e| e.key().clone()).collect();
        let mut closing = Vec::with_capacity(remotes.len());
        for remote in remotes {
            if let Some((_, link)) = self.links.remove(&remote) {
                closing.push(link);
            }
        }
        join_all(closing.iter().map(|link| link.close())).await;

        self.lanes.clear();
        self.early_candidates.clear();
        self.retired_links.clear();
        self.recovering.clear();

        let departed: Vec<ParticipantId> = self.participants.iter().map(|e| e.key().clone()).collect();
        for participant_id in departed {
            self.participants.remove(&participant_id);
            self.emit(SessionEvent::ParticipantLeft { participant_id });
        }

        if let Err(e) = self.store.delete_membership(&scope, &self.local).await {
            warn!(%scope, error = %e, "Failed to delete membership");
        }

        {
            let mut session = self.session.write();
            session.state = SessionState::Idle;
            session.scope = None;
            session.epoch = None;
        }
        self.emit_state();
        info!(%scope, links = closing.len(), "Left session");
    }

    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.read().state
    }

    #[must_use]
    pub fn active_scope(&self) -> Option<Scope> {
        self.session.read().scope.clone()
    }

    #[must_use]
    pub fn local_epoch(&self) -> Option<Epoch> {
        self.session.read().epoch
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.session.read().muted
    }

    #[must_use]
    pub fn is_deafened(&self) -> bool {
        self.session.read().deafened
    }

    #[must_use]
    pub fn noise_suppression(&self) -> bool {
        self.session.read().noise_suppression
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn link_to(&self, remote: &ParticipantId) -> Option<Arc<PeerLink>> {
        self.links.get(remote).map(|l| Arc::clone(l.value()))
    }

    #[must_use]
    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn local_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.tracks.get(kind)
    }

    #[must_use]
    pub fn active_tracks(&self) -> Vec<TrackKind> {
        self.tracks.active_kinds()
    }

    /// Remote participants of the active scope, ordered by id
    #[must_use]
    pub fn participants(&self) -> Vec<RemoteParticipant> {
        let mut out: Vec<RemoteParticipant> = self
            .participants
            .iter()
            .map(|entry| {
                let member = entry.value();
                let link = self.link_to(&member.participant_id);
                RemoteParticipant {
                    participant_id: member.participant_id.clone(),
                    epoch: member.joined_at,
                    flags: member.flags,
                    connection: link.as_ref().map(|l| l.connection_state()),
                    remote_tracks: link.map(|l| l.remote_tracks()).unwrap_or_default(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        out
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn intent_version(&self) -> u64 {
        self.current_intent()
    }

    fn bump_intent(&self) -> u64 {
        self.intent.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn current_intent(&self) -> u64 {
        self.intent.load(Ordering::Acquire)
    }

    pub(crate) fn is_current(&self, intent: u64) -> bool {
        self.current_intent() == intent
    }

    /// The joining or active session, if any
    pub(crate) fn active_session(&self) -> Option<ActiveSession> {
        let session = self.session.read();
        if !matches!(session.state, SessionState::Joining | SessionState::Active) {
            return None;
        }
        session.epoch?;
        Some(ActiveSession {
            scope: session.scope.clone()?,
            intent: self.current_intent(),
        })
    }

    fn member_flags(&self) -> MemberFlags {
        let session = self.session.read();
        MemberFlags {
            muted: session.muted,
            deafened: session.deafened,
            video: self.tracks.is_active(TrackKind::Camera),
            screen_sharing: self.tracks.is_active(TrackKind::Screen),
        }
    }

    /// Push the local flags to the membership row
    async fn publish_flags(&self) {
        let scope = {
            let session = self.session.read();
            if session.state != SessionState::Active {
                return;
            }
            session.scope.clone()
        };
        let Some(scope) = scope else { return };
        if let Err(e) = self
            .store
            .update_membership(&scope, &self.local, self.member_flags())
            .await
        {
            warn!(%scope, error = %e, "Failed to update membership flags");
        }
    }

    fn record_participant(&self, member: &Membership) {
        let previous = self
            .participants
            .insert(member.participant_id.clone(), member.clone());
        match previous {
            Some(prev) if prev.joined_at == member.joined_at => {
                if prev.flags != member.flags {
                    self.emit(SessionEvent::ParticipantUpdated {
                        participant_id: member.participant_id.clone(),
                        flags: member.flags,
                    });
                }
            }
            _ => self.emit(SessionEvent::ParticipantJoined {
                participant_id: member.participant_id.clone(),
                epoch: member.joined_at,
            }),
        }
    }

    fn report_media_error(&self, error: &Error) {
        if let Error::MediaAcquisition { kind, .. } = error {
            self.emit(SessionEvent::MediaError {
                kind: *kind,
                message: error.user_message().unwrap_or_else(|| error.to_string()),
            });
        }
    }

    fn emit_state(&self) {
        let (state, scope) = {
            let session = self.session.read();
            (session.state, session.scope.clone())
        };
        self.emit(SessionEvent::StateChanged { state, scope });
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SessionControl for SessionCoordinator {
    async fn force_leave(&self, reason: &str) {
        Self::force_leave(self, reason).await;
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
