//! Single-process backend for the membership table, the signal relay and the
//! presence channel.
//!
//! Fan-out follows the room hub pattern: subscribers register an unbounded
//! sender and are dropped on the first failed send. Test hooks inject relay
//! status changes, redeliveries, send failures and held deliveries.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voxmesh_core::backend::{MembershipChange, MembershipStore, PresenceChannel, PresenceEvent, SignalRelay};
use voxmesh_core::models::{
    MemberFlags, Membership, ParticipantId, PresenceRecord, PresenceStatus, RelayStatus, Scope, Signal,
};
use voxmesh_core::{Error, Result};

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// scope -> rows, in insertion order
    memberships: DashMap<Scope, Vec<Membership>>,
    membership_watchers: DashMap<Scope, Vec<mpsc::UnboundedSender<MembershipChange>>>,
    signal_subscribers: DashMap<ParticipantId, Vec<mpsc::UnboundedSender<Signal>>>,
    presence: DashMap<ParticipantId, PresenceRecord>,
    presence_subscribers: Mutex<Vec<mpsc::UnboundedSender<PresenceEvent>>>,
    relay_status: Mutex<Option<RelayStatus>>,

    // Test hooks and counters
    sent_signals: Mutex<Vec<Signal>>,
    held_signals: Mutex<Option<Vec<Signal>>>,
    duplicate_delivery: AtomicBool,
    fail_sends: AtomicBool,
    membership_inserts: AtomicUsize,
    membership_deletes: AtomicUsize,
    heartbeats: DashMap<ParticipantId, usize>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_watchers(&self, scope: &Scope, change: &MembershipChange) {
        if let Some(mut watchers) = self.inner.membership_watchers.get_mut(scope) {
            watchers.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }

    fn broadcast_presence(&self, event: &PresenceEvent) {
        self.inner
            .presence_subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn deliver(&self, signal: &Signal) -> usize {
        let copies = if self.inner.duplicate_delivery.load(Ordering::Acquire) {
            2
        } else {
            1
        };
        let mut delivered = 0;
        if let Some(mut subscribers) = self.inner.signal_subscribers.get_mut(&signal.to) {
            subscribers.retain(|tx| {
                for _ in 0..copies {
                    if tx.send(signal.clone()).is_err() {
                        return false;
                    }
                }
                delivered += 1;
                true
            });
        }
        delivered
    }

    /// Push a signal straight to its recipient, bypassing the send log
    pub fn inject_signal(&self, signal: &Signal) -> usize {
        self.deliver(signal)
    }

    /// Report a relay subscription state to every presence subscriber
    pub fn set_relay_status(&self, status: RelayStatus) {
        info!(%status, "Relay status changed");
        *self.inner.relay_status.lock() = Some(status);
        self.broadcast_presence(&PresenceEvent::Status(status));
    }

    /// Close every presence subscription as a relay restart would
    pub fn drop_presence_subscriptions(&self) {
        let dropped = std::mem::take(&mut *self.inner.presence_subscribers.lock());
        info!(count = dropped.len(), "Presence subscriptions dropped");
    }

    /// Deliver every signal twice
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::Release);
    }

    /// Make `send_signal` fail with a relay error
    pub fn set_send_failure(&self, enabled: bool) {
        self.inner.fail_sends.store(enabled, Ordering::Release);
    }

    /// Queue sent signals instead of delivering them
    pub fn hold_signals(&self) {
        let mut held = self.inner.held_signals.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Deliver held signals in send order and resume normal delivery
    pub fn release_signals(&self) -> usize {
        let held = self.inner.held_signals.lock().take().unwrap_or_default();
        let count = held.len();
        for signal in &held {
            self.deliver(signal);
        }
        count
    }

    /// Every signal accepted by `send_signal`, in order
    #[must_use]
    pub fn sent_signals(&self) -> Vec<Signal> {
        self.inner.sent_signals.lock().clone()
    }

    #[must_use]
    pub fn sent_signals_to(&self, to: &ParticipantId) -> Vec<Signal> {
        self.inner
            .sent_signals
            .lock()
            .iter()
            .filter(|s| &s.to == to)
            .cloned()
            .collect()
    }

    pub fn clear_sent_signals(&self) {
        self.inner.sent_signals.lock().clear();
    }

    #[must_use]
    pub fn membership_inserts(&self) -> usize {
        self.inner.membership_inserts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn membership_deletes(&self) -> usize {
        self.inner.membership_deletes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn heartbeat_count(&self, participant_id: &ParticipantId) -> usize {
        self.inner.heartbeats.get(participant_id).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn presence_record(&self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        self.inner.presence.get(participant_id).map(|r| r.value().clone())
    }

    /// Rows of `scope` without going through the async trait
    #[must_use]
    pub fn members(&self, scope: &Scope) -> Vec<Membership> {
        self.inner
            .memberships
            .get(scope)
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MembershipStore for InMemoryBackend {
    async fn insert_membership(&self, membership: Membership) -> Result<()> {
        let scope = membership.scope.clone();
        {
            let mut rows = self.inner.memberships.entry(scope.clone()).or_default();
            rows.retain(|m| m.participant_id != membership.participant_id);
            rows.push(membership.clone());
        }
        self.inner.membership_inserts.fetch_add(1, Ordering::AcqRel);
        debug!(
            %scope,
            participant_id = %membership.participant_id,
            joined_at = %membership.joined_at,
            "Membership inserted"
        );
        self.notify_watchers(&scope, &MembershipChange::Inserted(membership));
        Ok(())
    }

    async fn delete_membership(&self, scope: &Scope, participant_id: &ParticipantId) -> Result<()> {
        let removed = match self.inner.memberships.get_mut(scope) {
            Some(mut rows) => {
                let before = rows.len();
                rows.retain(|m| &m.participant_id != participant_id);
                rows.len() != before
            }
            None => false,
        };
        if removed {
            self.inner.membership_deletes.fetch_add(1, Ordering::AcqRel);
            debug!(%scope, %participant_id, "Membership deleted");
            self.notify_watchers(
                scope,
                &MembershipChange::Deleted {
                    scope: scope.clone(),
                    participant_id: participant_id.clone(),
                },
            );
        }
        Ok(())
    }

    async fn update_membership(
        &self,
        scope: &Scope,
        participant_id: &ParticipantId,
        flags: MemberFlags,
    ) -> Result<()> {
        let updated = {
            let mut rows = self
                .inner
                .memberships
                .get_mut(scope)
                .ok_or_else(|| Error::NotFound(format!("membership {participant_id} in {scope}")))?;
            let row = rows
                .iter_mut()
                .find(|m| &m.participant_id == participant_id)
                .ok_or_else(|| Error::NotFound(format!("membership {participant_id} in {scope}")))?;
            row.flags = flags;
            row.clone()
        };
        self.notify_watchers(scope, &MembershipChange::Updated(updated));
        Ok(())
    }

    async fn list_memberships(&self, scope: &Scope) -> Result<Vec<Membership>> {
        Ok(self.members(scope))
    }

    async fn watch_memberships(&self, scope: &Scope) -> Result<mpsc::UnboundedReceiver<MembershipChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .membership_watchers
            .entry(scope.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl SignalRelay for InMemoryBackend {
    async fn send_signal(&self, signal: Signal) -> Result<()> {
        if self.inner.fail_sends.load(Ordering::Acquire) {
            return Err(Error::Relay("relay unavailable".to_string()));
        }
        self.inner.sent_signals.lock().push(signal.clone());

        {
            let mut held = self.inner.held_signals.lock();
            if let Some(queue) = held.as_mut() {
                queue.push(signal);
                return Ok(());
            }
        }

        if self.deliver(&signal) == 0 {
            // Durable store semantics are out of scope here; an absent
            // recipient simply never reads the row
            debug!(signal_id = %signal.id, to = %signal.to, "No subscriber for signal");
        }
        Ok(())
    }

    async fn subscribe_signals(&self, participant_id: &ParticipantId) -> Result<mpsc::UnboundedReceiver<Signal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .signal_subscribers
            .entry(participant_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl PresenceChannel for InMemoryBackend {
    async fn track_presence(&self, record: PresenceRecord) -> Result<()> {
        self.inner.presence.insert(record.participant_id.clone(), record.clone());
        self.broadcast_presence(&PresenceEvent::Join(record));
        Ok(())
    }

    async fn untrack_presence(&self, participant_id: &ParticipantId) -> Result<()> {
        if self.inner.presence.remove(participant_id).is_some() {
            self.broadcast_presence(&PresenceEvent::Leave(participant_id.clone()));
        }
        Ok(())
    }

    async fn heartbeat(&self, participant_id: &ParticipantId) -> Result<()> {
        *self.inner.heartbeats.entry(participant_id.clone()).or_insert(0) += 1;
        let refreshed = {
            let mut record = self
                .inner
                .presence
                .entry(participant_id.clone())
                .or_insert_with(|| PresenceRecord::new(participant_id.clone(), PresenceStatus::Online));
            record.last_seen_at = Utc::now();
            record.clone()
        };
        self.broadcast_presence(&PresenceEvent::Join(refreshed));
        Ok(())
    }

    async fn subscribe_presence(&self) -> Result<mpsc::UnboundedReceiver<PresenceEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot: Vec<PresenceRecord> = self.inner.presence.iter().map(|r| r.value().clone()).collect();
        let status = (*self.inner.relay_status.lock()).unwrap_or(RelayStatus::Subscribed);
        if tx.send(PresenceEvent::Sync(snapshot)).is_err() || tx.send(PresenceEvent::Status(status)).is_err() {
            warn!("Presence subscriber dropped before initial sync");
        }
        self.inner.presence_subscribers.lock().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxmesh_core::models::{ChannelId, Epoch, LinkId, SignalPayload};

    fn channel(id: &str) -> Scope {
        Scope::Channel(ChannelId::from(id))
    }

    fn member(scope: &Scope, id: &str, epoch: i64) -> Membership {
        Membership::new(scope.clone(), ParticipantId::from(id), Epoch(epoch), MemberFlags::default())
    }

    #[tokio::test]
    async fn test_membership_changes_are_observed() {
        let backend = InMemoryBackend::new();
        let scope = channel("42");
        let mut rx = backend.watch_memberships(&scope).await.unwrap();

        backend.insert_membership(member(&scope, "p1", 1)).await.unwrap();
        backend
            .update_membership(
                &scope,
                &ParticipantId::from("p1"),
                MemberFlags {
                    muted: true,
                    ..MemberFlags::default()
                },
            )
            .await
            .unwrap();
        backend.delete_membership(&scope, &ParticipantId::from("p1")).await.unwrap();
        // Deleting twice is silent
        backend.delete_membership(&scope, &ParticipantId::from("p1")).await.unwrap();

        assert!(matches!(rx.recv().await, Some(MembershipChange::Inserted(_))));
        match rx.recv().await {
            Some(MembershipChange::Updated(m)) => assert!(m.flags.muted),
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(MembershipChange::Deleted { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.membership_deletes(), 1);
    }

    #[tokio::test]
    async fn test_reinsert_replaces_row() {
        let backend = InMemoryBackend::new();
        let scope = channel("42");
        backend.insert_membership(member(&scope, "p1", 1)).await.unwrap();
        backend.insert_membership(member(&scope, "p1", 2)).await.unwrap();

        let rows = backend.list_memberships(&scope).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].joined_at, Epoch(2));
        assert!(backend.list_memberships(&channel("7")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signals_route_to_recipient_and_hold() {
        let backend = InMemoryBackend::new();
        let mut bob = backend.subscribe_signals(&ParticipantId::from("bob")).await.unwrap();
        let signal = Signal::new(
            channel("42"),
            ParticipantId::from("alice"),
            ParticipantId::from("bob"),
            Epoch(1),
            LinkId::from("l1"),
            SignalPayload::Answer { sdp: "v=0".to_string() },
        );

        backend.hold_signals();
        backend.send_signal(signal.clone()).await.unwrap();
        assert!(bob.try_recv().is_err());

        assert_eq!(backend.release_signals(), 1);
        assert_eq!(bob.recv().await.unwrap().id, signal.id);

        backend.set_duplicate_delivery(true);
        backend.send_signal(signal.clone()).await.unwrap();
        assert_eq!(bob.recv().await.unwrap().id, signal.id);
        assert_eq!(bob.recv().await.unwrap().id, signal.id);
        assert_eq!(backend.sent_signals_to(&ParticipantId::from("bob")).len(), 2);
    }

    #[tokio::test]
    async fn test_presence_subscription_starts_with_snapshot() {
        let backend = InMemoryBackend::new();
        backend
            .track_presence(PresenceRecord::new(ParticipantId::from("p1"), PresenceStatus::Online))
            .await
            .unwrap();

        let mut rx = backend.subscribe_presence().await.unwrap();
        match rx.recv().await {
            Some(PresenceEvent::Sync(records)) => assert_eq!(records.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(PresenceEvent::Status(RelayStatus::Subscribed)));

        backend.set_relay_status(RelayStatus::Closed);
        assert_eq!(rx.recv().await, Some(PresenceEvent::Status(RelayStatus::Closed)));
    }
}
