use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxmesh_core::models::{Membership, ParticipantId, Scope};

use super::SessionCoordinator;
use crate::events::SessionEvent;
use crate::link::PeerLink;

impl SessionCoordinator {
    /// Bring participants and links in line with `current`, the full
    /// membership list of the active scope.
    pub async fn reconcile_membership(&self, current: Vec<Membership>) {
        self.reconcile_with(current, None).await;
    }

    /// Fetch the membership list and reconcile against it
    pub(crate) async fn refresh_membership(&self, intent: u64) {
        let Some(active) = self.active_session() else { return };
        if !self.is_current(intent) {
            return;
        }
        let as_of = Instant::now();
        match self.store.list_memberships(&active.scope).await {
            Ok(members) if self.is_current(intent) => self.reconcile_with(members, Some(as_of)).await,
            Ok(_) => debug!("Session changed during membership refresh"),
            Err(e) => warn!(scope = %active.scope, error = %e, "Failed to list memberships"),
        }
    }

    /// Links created after `as_of` are newer than the list and are not torn
    /// down for being absent from it.
    async fn reconcile_with(&self, current: Vec<Membership>, as_of: Option<Instant>) {
        let Some(active) = self.active_session() else { return };
        let current: HashMap<ParticipantId, Membership> = current
            .into_iter()
            .filter(|m| m.scope == active.scope && m.participant_id != self.local)
            .map(|m| (m.participant_id.clone(), m))
            .collect();

        let departed: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|entry| !current.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for participant_id in departed {
            self.participants.remove(&participant_id);
            self.early_candidates.remove(&participant_id);
            self.recovering.remove(&participant_id);
            debug!(participant = %participant_id, "Participant left");
            self.emit(SessionEvent::ParticipantLeft { participant_id });
        }
        for member in current.values() {
            self.record_participant(member);
        }

        let mut stale: Vec<(Arc<PeerLink>, &'static str)> = Vec::new();
        for link in self.links() {
            let newer_than_list = as_of.is_some_and(|t| link.created_at() > t);
            match current.get(link.remote()) {
                None if !newer_than_list => stale.push((link, "participant left")),
                Some(member) if member.joined_at > link.remote_epoch() => {
                    stale.push((link, "participant rejoined"));
                }
                _ => {}
            }
        }
        for (link, reason) in stale {
            info!(remote = %link.remote(), link = %link.id(), reason, "Closing stale link");
            self.retire(&link);
            self.discard_link(&link).await;
        }

        let reconnect: Vec<Membership> = self
            .recovering
            .iter()
            .filter_map(|id| current.get(id.key()).cloned())
            .filter(|m| self.link_to(&m.participant_id).is_none())
            .collect();
        if !reconnect.is_empty() {
            info!(count = reconnect.len(), "Reconnecting failed links");
        }
        join_all(
            reconnect
                .into_iter()
                .map(|member| self.connect_to(member, active.intent)),
        )
        .await;
    }

    /// Refresh on every change of the scope's membership table
    pub(crate) async fn spawn_membership_watcher(&self, scope: &Scope, intent: u64, tasks: &CancellationToken) {
        let mut changes = match self.store.watch_memberships(scope).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(%scope, error = %e, "Membership watch unavailable, relying on periodic reconcile");
                return;
            }
        };
        let weak = self.weak_self.clone();
        let tasks = tasks.clone();

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    () = tasks.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                debug!(participant = %change.participant_id(), "Membership changed");
                // Coalesce a burst into one refresh
                while changes.try_recv().is_ok() {}

                let Some(this) = weak.upgrade() else { break };
                this.refresh_membership(intent).await;
            }
        });
    }

    pub(crate) fn spawn_reconcile_ticker(&self, intent: u64, tasks: &CancellationToken) {
        let period = self.mesh.reconcile_interval();
        let weak = self.weak_self.clone();
        let tasks = tasks.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = tasks.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.refresh_membership(intent).await;
                    }
                }
            }
        });
    }
}
