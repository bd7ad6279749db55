use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use voxmesh_core::models::{
    Epoch, IceCandidate, LinkId, Membership, ParticipantId, Scope, SessionDescription, Signal,
    SignalPayload,
};
use voxmesh_core::{Error, Result};

use super::{ActiveSession, SessionCoordinator};
use crate::events::{DropReason, SessionEvent, SignalOutcome};
use crate::link::{CandidateDisposition, NegotiationState, PeerLink};
use crate::transport::{ConnectionState, TransportEvent};

const MAX_EARLY_CANDIDATES: usize = 64;
const MAX_RETIRED_LINKS: usize = 8;

impl SessionCoordinator {
    /// Queue an inbound signal on its sender's lane
    pub(crate) fn route_signal(&self, signal: Signal) {
        let from = signal.from.clone();
        let lane = self
            .lanes
            .entry(from.clone())
            .or_insert_with(|| self.spawn_lane(from.clone()))
            .value()
            .clone();

        if let Err(mpsc::error::SendError(signal)) = lane.send(signal) {
            // The lane's task is gone; start a fresh one
            let lane = self.spawn_lane(from.clone());
            let _ = lane.send(signal);
            self.lanes.insert(from, lane);
        }
    }

    fn spawn_lane(&self, remote: ParticipantId) -> mpsc::UnboundedSender<Signal> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let weak = self.weak_self.clone();

        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                let signal_id = signal.id.clone();
                let kind = signal.kind();
                let outcome = this.handle_inbound_signal(signal).await;
                debug!(from = %remote, %signal_id, %kind, ?outcome, "Inbound signal handled");
            }
        });
        tx
    }

    /// Apply one inbound signal. Signals for another scope, an older session
    /// of the sender, or a link we already tore down are dropped without
    /// touching any state.
    pub async fn handle_inbound_signal(&self, signal: Signal) -> SignalOutcome {
        let Some(active) = self.active_session() else {
            return SignalOutcome::Dropped(DropReason::NoActiveSession);
        };
        if signal.scope != active.scope {
            debug!(
                expected = %active.scope,
                got = %signal.scope,
                from = %signal.from,
                "Dropping signal for another scope"
            );
            return SignalOutcome::Dropped(DropReason::ScopeMismatch);
        }
        if signal.to != self.local || signal.from == self.local {
            return SignalOutcome::Dropped(DropReason::NotAddressed);
        }
        if self.is_retired(&signal.from, &signal.link_id) {
            debug!(from = %signal.from, link = %signal.link_id, "Dropping signal for retired link");
            return SignalOutcome::Dropped(DropReason::StaleLink);
        }

        match &signal.payload {
            SignalPayload::Offer { sdp } => self.handle_offer(&signal, sdp.clone(), &active).await,
            SignalPayload::Answer { sdp } => self.handle_answer(&signal, sdp.clone()).await,
            SignalPayload::IceCandidate(candidate) => {
                self.handle_candidate(&signal, candidate.clone()).await
            }
        }
    }

    async fn handle_offer(&self, signal: &Signal, sdp: String, active: &ActiveSession) -> SignalOutcome {
        let remote = &signal.from;

        let link = match self.link_to(remote) {
            Some(link) if signal.epoch < link.remote_epoch() => {
                debug!(from = %remote, epoch = %signal.epoch, "Dropping offer from older session");
                return SignalOutcome::Dropped(DropReason::StaleEpoch);
            }
            Some(link)
                if signal.epoch == link.remote_epoch()
                    && link.remote_link_id().map_or(true, |id| id == signal.link_id) =>
            {
                if link.negotiation_state() == NegotiationState::HaveLocalOffer {
                    if !self.is_polite_towards(remote) {
                        debug!(from = %remote, "Glare: keeping our offer");
                        return SignalOutcome::Dropped(DropReason::Glare);
                    }
                    info!(from = %remote, "Glare: rolling back our offer");
                    if let Err(e) = link.rollback().await {
                        self.fail_link(&link, &e).await;
                        return SignalOutcome::Dropped(DropReason::NegotiationFailed);
                    }
                }
                link
            }
            // New peer, newer session of a known peer, or the peer rebuilt its link
            _ => match self
                .open_link(remote, signal.epoch, Some(&signal.link_id), &active.scope, active.intent)
                .await
            {
                Ok(Some(link)) => link,
                Ok(None) => return SignalOutcome::Dropped(DropReason::Superseded),
                Err(e) => {
                    warn!(from = %remote, error = %e, "Failed to open link for offer");
                    return SignalOutcome::Dropped(DropReason::NegotiationFailed);
                }
            },
        };

        link.set_remote_link_id(signal.link_id.clone());
        self.flush_early_candidates(&link, &signal.link_id).await;

        if let Err(e) = self
            .bounded(link.set_remote_description(SessionDescription::offer(sdp)))
            .await
        {
            self.fail_link(&link, &e).await;
            return SignalOutcome::Dropped(DropReason::NegotiationFailed);
        }
        let answer = match self.bounded(link.create_answer()).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_link(&link, &e).await;
                return SignalOutcome::Dropped(DropReason::NegotiationFailed);
            }
        };

        if !self.is_current(active.intent) || !self.is_installed(&link) {
            return SignalOutcome::Dropped(DropReason::Superseded);
        }
        if let Err(e) = self.send_signal(&link, SignalPayload::Answer { sdp: answer }).await {
            self.fail_link(&link, &e).await;
            return SignalOutcome::Dropped(DropReason::NegotiationFailed);
        }

        if link.take_negotiation_needed() {
            self.send_offer(&link, active.intent).await;
        }
        SignalOutcome::Applied
    }

    async fn handle_answer(&self, signal: &Signal, sdp: String) -> SignalOutcome {
        let remote = &signal.from;
        let Some(link) = self.link_to(remote) else {
            debug!(from = %remote, "Answer without a link");
            return SignalOutcome::Dropped(DropReason::OutOfOrder);
        };
        if signal.epoch != link.remote_epoch() {
            debug!(from = %remote, epoch = %signal.epoch, link_epoch = %link.remote_epoch(), "Answer epoch does not match link");
            return SignalOutcome::Dropped(DropReason::StaleEpoch);
        }
        match link.remote_link_id() {
            Some(id) if id != signal.link_id => {
                return SignalOutcome::Dropped(DropReason::StaleLink);
            }
            Some(_) => {}
            None => link.set_remote_link_id(signal.link_id.clone()),
        }
        self.flush_early_candidates(&link, &signal.link_id).await;

        match self
            .bounded(link.set_remote_description(SessionDescription::answer(sdp)))
            .await
        {
            Ok(()) => {}
            Err(Error::OutOfOrder(reason)) => {
                debug!(from = %remote, reason, "Dropping out-of-order answer");
                return SignalOutcome::Dropped(DropReason::OutOfOrder);
            }
            Err(e) => {
                self.fail_link(&link, &e).await;
                return SignalOutcome::Dropped(DropReason::NegotiationFailed);
            }
        }

        if link.take_negotiation_needed() {
            let intent = self.current_intent();
            self.send_offer(&link, intent).await;
        }
        SignalOutcome::Applied
    }

    async fn handle_candidate(&self, signal: &Signal, candidate: IceCandidate) -> SignalOutcome {
        let remote = &signal.from;
        let Some(link) = self.link_to(remote) else {
            self.stash_candidate(remote, &signal.link_id, candidate);
            return SignalOutcome::Buffered;
        };
        if signal.epoch < link.remote_epoch() {
            return SignalOutcome::Dropped(DropReason::StaleEpoch);
        }

        let belongs = match link.remote_link_id() {
            Some(id) => id == signal.link_id,
            None if signal.epoch == link.remote_epoch() => {
                link.set_remote_link_id(signal.link_id.clone());
                true
            }
            None => false,
        };
        if !belongs {
            // Candidate for a remote link whose offer has not arrived yet
            self.stash_candidate(remote, &signal.link_id, candidate);
            return SignalOutcome::Buffered;
        }

        match link.add_ice_candidate(candidate).await {
            Ok(CandidateDisposition::Applied) => SignalOutcome::Applied,
            Ok(CandidateDisposition::Buffered) => SignalOutcome::Buffered,
            Err(e) => {
                warn!(from = %remote, link = %link.id(), error = %e, "Failed to apply ICE candidate");
                SignalOutcome::Dropped(DropReason::NegotiationFailed)
            }
        }
    }

    fn stash_candidate(&self, remote: &ParticipantId, link_id: &LinkId, candidate: IceCandidate) {
        let mut stash = self.early_candidates.entry(remote.clone()).or_default();
        if stash.len() >= MAX_EARLY_CANDIDATES {
            stash.remove(0);
        }
        stash.push((link_id.clone(), candidate));
    }

    /// Hand stashed candidates of `remote_link` to `link`, in arrival order
    async fn flush_early_candidates(&self, link: &PeerLink, remote_link: &LinkId) {
        let matching: Vec<IceCandidate> = {
            let Some(mut stash) = self.early_candidates.get_mut(link.remote()) else {
                return;
            };
            let (matching, rest): (Vec<_>, Vec<_>) = stash.drain(..).partition(|(id, _)| id == remote_link);
            *stash = rest;
            matching.into_iter().map(|(_, c)| c).collect()
        };
        self.early_candidates.remove_if(link.remote(), |_, stash| stash.is_empty());

        for candidate in matching {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!(link = %link.id(), error = %e, "Failed to apply stashed ICE candidate");
            }
        }
    }

    /// Offer to `member`, unless a link to its current session already exists
    pub(crate) async fn connect_to(&self, member: Membership, intent: u64) {
        let Some(active) = self.active_session() else { return };
        if !self.is_current(intent) {
            return;
        }
        let remote = &member.participant_id;
        if let Some(existing) = self.link_to(remote) {
            if existing.remote_epoch() >= member.joined_at {
                debug!(remote = %remote, "Link already established");
                return;
            }
        }

        match self
            .open_link(remote, member.joined_at, None, &active.scope, intent)
            .await
        {
            Ok(Some(link)) => self.send_offer(&link, intent).await,
            Ok(None) => debug!(remote = %remote, "Session changed while connecting"),
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to connect");
                self.recovering.insert(remote.clone());
                self.emit(SessionEvent::LinkFailed {
                    participant_id: remote.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Create a link, install it in place of any previous one and attach the
    /// local sources. `None` when the session changed meanwhile.
    async fn open_link(
        &self,
        remote: &ParticipantId,
        remote_epoch: Epoch,
        remote_link: Option<&LinkId>,
        scope: &Scope,
        intent: u64,
    ) -> Result<Option<Arc<PeerLink>>> {
        let link = self.create_link(remote, remote_epoch, scope).await?;
        if let Some(remote_link) = remote_link {
            link.set_remote_link_id(remote_link.clone());
        }
        if !self.is_current(intent) {
            link.close().await;
            return Ok(None);
        }
        self.install_link(&link).await;

        if let Err(e) = self.tracks.attach_all(&link).await {
            self.fail_link(&link, &e).await;
            return Err(e);
        }
        if !self.is_current(intent) {
            self.discard_link(&link).await;
            return Ok(None);
        }
        Ok(Some(link))
    }

    async fn create_link(&self, remote: &ParticipantId, remote_epoch: Epoch, scope: &Scope) -> Result<Arc<PeerLink>> {
        let link_id = LinkId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(&link_id, remote, tx).await?;
        let link = Arc::new(PeerLink::new(
            link_id,
            scope.clone(),
            remote.clone(),
            remote_epoch,
            transport,
        ));

        let weak = self.weak_self.clone();
        let forwarded = Arc::clone(&link);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = forwarded.closed() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else { break };
                this.on_transport_event(&forwarded, event).await;
            }
        });

        debug!(remote = %remote, link = %link.id(), epoch = %remote_epoch, "Link created");
        Ok(link)
    }

    async fn install_link(&self, link: &Arc<PeerLink>) {
        let previous = self.links.insert(link.remote().clone(), Arc::clone(link));
        self.recovering.remove(link.remote());

        if let Some(previous) = previous {
            if previous.id() != link.id() {
                info!(
                    remote = %link.remote(),
                    old = %previous.id(),
                    new = %link.id(),
                    "Replacing link"
                );
                // Two local paths racing for the same remote session do not
                // make the remote's link stale
                let superseded = previous.remote_epoch() < link.remote_epoch()
                    || link
                        .remote_link_id()
                        .is_some_and(|id| previous.remote_link_id().is_some_and(|prev| prev != id));
                if superseded {
                    self.retire(&previous);
                }
                self.close_link(&previous).await;
            }
        }
    }

    pub(crate) fn is_installed(&self, link: &PeerLink) -> bool {
        self.links
            .get(link.remote())
            .is_some_and(|current| current.id() == link.id())
    }

    /// Uninstall `link` if it is still the current one, then close it
    pub(crate) async fn discard_link(&self, link: &Arc<PeerLink>) -> bool {
        let removed = self
            .links
            .remove_if(link.remote(), |_, current| current.id() == link.id())
            .is_some();
        self.close_link(link).await;
        removed
    }

    pub(crate) async fn close_link(&self, link: &PeerLink) {
        let remote_tracks = link.remote_tracks();
        if link.close().await {
            for kind in remote_tracks {
                self.emit(SessionEvent::RemoteTrackRemoved {
                    participant_id: link.remote().clone(),
                    kind,
                });
            }
        }
    }

    pub(crate) fn retire(&self, link: &PeerLink) {
        let Some(remote_link) = link.remote_link_id() else {
            return;
        };
        let mut retired = self.retired_links.entry(link.remote().clone()).or_default();
        if !retired.contains(&remote_link) {
            if retired.len() >= MAX_RETIRED_LINKS {
                retired.remove(0);
            }
            retired.push(remote_link);
        }
    }

    fn is_retired(&self, remote: &ParticipantId, link_id: &LinkId) -> bool {
        self.retired_links
            .get(remote)
            .is_some_and(|retired| retired.contains(link_id))
    }

    /// Tear down a link that cannot continue and queue its peer for reconnection
    pub(crate) async fn fail_link(&self, link: &Arc<PeerLink>, error: &Error) {
        warn!(remote = %link.remote(), link = %link.id(), error = %error, "Link failed");
        let removed = self.discard_link(link).await;
        if removed && self.active_session().is_some() {
            self.retire(link);
            self.recovering.insert(link.remote().clone());
            self.emit(SessionEvent::LinkFailed {
                participant_id: link.remote().clone(),
                reason: error.to_string(),
            });
        }
    }

    /// Create and send an offer on `link`. While another exchange is in
    /// flight the link remembers to offer once it settles.
    pub(crate) async fn send_offer(&self, link: &Arc<PeerLink>, intent: u64) {
        if !self.is_current(intent) || !self.is_installed(link) {
            return;
        }
        let sdp = match self.bounded(link.create_offer()).await {
            Ok(sdp) => sdp,
            Err(Error::InvalidState(reason)) if !link.is_closed() => {
                debug!(link = %link.id(), reason, "Offer deferred");
                return;
            }
            Err(e) => {
                self.fail_link(link, &e).await;
                return;
            }
        };
        if !self.is_current(intent) || !self.is_installed(link) {
            return;
        }
        if let Err(e) = self.send_signal(link, SignalPayload::Offer { sdp }).await {
            self.fail_link(link, &e).await;
        }
    }

    async fn send_signal(&self, link: &PeerLink, payload: SignalPayload) -> Result<()> {
        let Some(epoch) = self.session.read().epoch else {
            return Err(Error::InvalidState("no active session".to_string()));
        };
        let signal = Signal::new(
            link.scope().clone(),
            self.local.clone(),
            link.remote().clone(),
            epoch,
            link.id().clone(),
            payload,
        );
        self.signals.send(signal).await
    }

    async fn on_transport_event(&self, link: &Arc<PeerLink>, event: TransportEvent) {
        if !link.apply_event(&event) || !self.is_installed(link) {
            return;
        }
        let remote = link.remote().clone();

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .send_signal(link, SignalPayload::IceCandidate(candidate))
                    .await
                {
                    warn!(remote = %remote, link = %link.id(), error = %e, "Failed to send ICE candidate");
                }
            }
            TransportEvent::RemoteTrack { kind, stream_id } => {
                self.emit(SessionEvent::RemoteTrackAdded {
                    participant_id: remote,
                    kind,
                    stream_id,
                });
            }
            TransportEvent::RemoteTrackEnded { kind } => {
                self.emit(SessionEvent::RemoteTrackRemoved {
                    participant_id: remote,
                    kind,
                });
            }
            TransportEvent::ConnectionState(ConnectionState::Connected) => {
                info!(remote = %remote, link = %link.id(), "Peer connected");
                self.emit(SessionEvent::PeerConnected {
                    participant_id: remote,
                    link_id: link.id().clone(),
                });
            }
            TransportEvent::ConnectionState(ConnectionState::Failed) => {
                self.fail_link(link, &Error::Transport("peer connection failed".to_string()))
                    .await;
            }
            TransportEvent::ConnectionState(state) => {
                debug!(remote = %remote, link = %link.id(), %state, "Connection state changed");
            }
        }
    }

    /// The participant with the greater id yields on glare
    fn is_polite_towards(&self, remote: &ParticipantId) -> bool {
        self.local > *remote
    }

    async fn bounded<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.mesh.negotiation_timeout(), step)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout("negotiation step".to_string())))
    }
}
