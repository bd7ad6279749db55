//! Presence tracking and relay outage handling.
//!
//! The tracker announces the local participant, keeps it fresh with
//! heartbeats and a longer keep-alive, derives away/idle from local input
//! inactivity and mirrors the remote presence set. When the relay reports a
//! disconnect it starts a grace timer; a resubscribe before it fires cancels
//! it, otherwise every active session is force-left exactly once. A presence
//! stream closed by the relay counts as a disconnect and is resubscribed.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voxmesh_core::backend::{PresenceChannel, PresenceEvent};
use voxmesh_core::config::PresenceConfig;
use voxmesh_core::models::{ParticipantId, PresenceRecord, PresenceStatus, RelayStatus};
use voxmesh_core::Result;

/// Reason handed to `SessionControl::force_leave` when the grace period lapses
pub const CONNECTION_LOST: &str = "connection lost";

/// Whatever owns the active sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Leave both the voice channel and the direct call
    async fn force_leave(&self, reason: &str);
}

struct LocalState {
    last_activity: Instant,
    announced: PresenceStatus,
    relay_status: RelayStatus,
    grace: Option<CancellationToken>,
    /// The forced leave already ran for the current outage
    outage_handled: bool,
}

pub struct PresenceTracker {
    local: ParticipantId,
    channel: Arc<dyn PresenceChannel>,
    config: PresenceConfig,
    records: DashMap<ParticipantId, PresenceRecord>,
    state: Mutex<LocalState>,
    control: RwLock<Option<Weak<dyn SessionControl>>>,
    forced_leaves: AtomicUsize,
    cancel_token: CancellationToken,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(local: ParticipantId, channel: Arc<dyn PresenceChannel>, config: PresenceConfig) -> Arc<Self> {
        Arc::new(Self {
            local,
            channel,
            config,
            records: DashMap::new(),
            state: Mutex::new(LocalState {
                last_activity: Instant::now(),
                announced: PresenceStatus::Online,
                relay_status: RelayStatus::Subscribed,
                grace: None,
                outage_handled: false,
            }),
            control: RwLock::new(None),
            forced_leaves: AtomicUsize::new(0),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Register the target of forced leaves. Held weakly.
    pub fn set_session_control(&self, control: Weak<dyn SessionControl>) {
        *self.control.write() = Some(control);
    }

    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Announce the local participant and start the background tasks
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.channel
            .track_presence(PresenceRecord::new(self.local.clone(), PresenceStatus::Online))
            .await?;
        let events = self.channel.subscribe_presence().await?;

        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run_event_loop(events).await });

        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run_maintenance().await });

        info!(
            participant_id = %self.local,
            heartbeat_secs = self.config.heartbeat_interval_secs,
            grace_secs = self.config.grace_period_secs,
            "Presence tracker started"
        );
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PresenceEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                event = events.recv() => event,
            };
            if let Some(event) = event {
                self.handle_event(event);
                continue;
            }
            warn!("Presence subscription closed by the relay");
            self.handle_relay_status(RelayStatus::Closed);
            match self.resubscribe().await {
                Some(next) => events = next,
                None => break,
            }
        }
    }

    /// Retry the presence subscription once per heartbeat interval. The fresh
    /// stream opens with a sync and a status event, which ends the outage.
    /// Returns `None` once the tracker is shut down.
    async fn resubscribe(&self) -> Option<mpsc::UnboundedReceiver<PresenceEvent>> {
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return None,
                () = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            }
            attempt += 1;
            match self.channel.subscribe_presence().await {
                Ok(events) => {
                    info!(attempt, "Presence subscription restored");
                    return Some(events);
                }
                Err(e) => warn!(error = %e, attempt, "Presence resubscribe failed"),
            }
        }
    }

    async fn run_maintenance(self: Arc<Self>) {
        let now = Instant::now();
        let mut heartbeat = interval_at(now + self.config.heartbeat_interval(), self.config.heartbeat_interval());
        let mut keepalive = interval_at(now + self.config.keepalive_interval(), self.config.keepalive_interval());
        let mut activity = interval_at(
            now + self.config.activity_check_interval(),
            self.config.activity_check_interval(),
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.channel.heartbeat(&self.local).await {
                        warn!(error = %e, "Presence heartbeat failed");
                    }
                }
                _ = keepalive.tick() => {
                    let status = self.local_status();
                    debug!(%status, "Presence keep-alive");
                    self.announce(status).await;
                }
                _ = activity.tick() => {
                    self.refresh_local_status().await;
                }
            }
        }
    }

    /// Apply one presence channel event
    pub fn handle_event(self: &Arc<Self>, event: PresenceEvent) {
        match event {
            PresenceEvent::Sync(records) => {
                self.records.clear();
                for record in records.into_iter().filter(|r| r.participant_id != self.local) {
                    self.records.insert(record.participant_id.clone(), record);
                }
                debug!(count = self.records.len(), "Presence synced");
            }
            PresenceEvent::Join(record) => {
                if record.participant_id != self.local {
                    self.records.insert(record.participant_id.clone(), record);
                }
            }
            PresenceEvent::Leave(participant_id) => {
                self.records.remove(&participant_id);
            }
            PresenceEvent::Status(status) => self.handle_relay_status(status),
        }
    }

    /// React to a relay subscription state change
    pub fn handle_relay_status(self: &Arc<Self>, status: RelayStatus) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.relay_status, status);

        if status.is_disconnected() {
            if state.grace.is_some() || state.outage_handled {
                debug!(%status, "Relay still disconnected");
                return;
            }
            let token = self.cancel_token.child_token();
            state.grace = Some(token.clone());
            drop(state);

            warn!(%status, grace_secs = self.config.grace_period_secs, "Relay disconnected, grace period started");
            let tracker = Arc::clone(self);
            tokio::spawn(async move { tracker.run_grace_timer(token).await });
        } else {
            let pending = state.grace.take();
            state.outage_handled = false;
            let announced = state.announced;
            drop(state);

            if let Some(token) = pending {
                token.cancel();
                info!("Relay resubscribed within the grace period");
            }
            if previous.is_disconnected() {
                let tracker = Arc::clone(self);
                tokio::spawn(async move { tracker.announce(announced).await });
            }
        }
    }

    async fn run_grace_timer(self: Arc<Self>, token: CancellationToken) {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(self.config.grace_period()) => {}
        }

        {
            let mut state = self.state.lock();
            if token.is_cancelled() {
                return;
            }
            state.grace = None;
            state.outage_handled = true;
        }

        self.forced_leaves.fetch_add(1, Ordering::AcqRel);
        error!(
            grace_secs = self.config.grace_period_secs,
            "Relay unreachable past the grace period, leaving active sessions"
        );
        let control = self.control.read().as_ref().and_then(Weak::upgrade);
        match control {
            Some(control) => control.force_leave(CONNECTION_LOST).await,
            None => warn!("No session control registered for forced leave"),
        }
    }

    async fn announce(&self, status: PresenceStatus) {
        let record = PresenceRecord::new(self.local.clone(), status);
        if let Err(e) = self.channel.track_presence(record).await {
            warn!(%status, error = %e, "Failed to announce presence");
        }
    }

    /// Note local input; an away or idle participant becomes online again
    pub async fn record_activity(&self) {
        let came_back = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            let came_back = state.announced != PresenceStatus::Online;
            state.announced = PresenceStatus::Online;
            came_back
        };
        if came_back {
            debug!("Local participant active again");
            self.announce(PresenceStatus::Online).await;
        }
    }

    /// Re-derive the local status and announce it if it changed
    pub async fn refresh_local_status(&self) -> PresenceStatus {
        let status = self.local_status();
        let changed = {
            let mut state = self.state.lock();
            let changed = state.announced != status;
            state.announced = status;
            changed
        };
        if changed {
            info!(%status, "Local presence changed");
            self.announce(status).await;
        }
        status
    }

    /// Online until the away timeout, away until the idle timeout, then idle
    #[must_use]
    pub fn local_status(&self) -> PresenceStatus {
        let inactive = self.state.lock().last_activity.elapsed();
        if inactive < self.config.away_timeout() {
            PresenceStatus::Online
        } else if inactive < self.config.idle_timeout() {
            PresenceStatus::Away
        } else {
            PresenceStatus::Idle
        }
    }

    #[must_use]
    pub fn get_status(&self, participant_id: &ParticipantId) -> PresenceStatus {
        if participant_id == &self.local {
            return self.local_status();
        }
        let Some(record) = self.records.get(participant_id) else {
            return PresenceStatus::Offline;
        };
        let age = Utc::now().signed_duration_since(record.last_seen_at);
        let stale = age.to_std().is_ok_and(|age| age > self.config.stale_after());
        if stale {
            PresenceStatus::Offline
        } else {
            record.status
        }
    }

    #[must_use]
    pub fn is_online(&self, participant_id: &ParticipantId) -> bool {
        self.get_status(participant_id).is_connected()
    }

    /// Remote participants currently considered connected
    #[must_use]
    pub fn online_participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self
            .records
            .iter()
            .map(|r| r.key().clone())
            .filter(|id| self.is_online(id))
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn relay_status(&self) -> RelayStatus {
        self.state.lock().relay_status
    }

    #[must_use]
    pub fn grace_pending(&self) -> bool {
        self.state.lock().grace.is_some()
    }

    /// Forced leaves fired so far
    #[must_use]
    pub fn forced_leave_count(&self) -> usize {
        self.forced_leaves.load(Ordering::Acquire)
    }

    /// Stop background tasks and send one last heartbeat
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.state.lock().grace = None;
        if let Err(e) = self.channel.heartbeat(&self.local).await {
            warn!(error = %e, "Final presence heartbeat failed");
        }
        info!(participant_id = %self.local, "Presence tracker stopped");
    }
}
