//! One peer link: the negotiation state machine over a single transport.
//!
//! Every negotiation step takes the link's operation lock so concurrent
//! callers (an inbound signal lane and a local track toggle) never interleave
//! inside a transport call. Candidates that arrive before any remote
//! description are buffered and flushed in arrival order.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxmesh_core::models::{
    Epoch, IceCandidate, LinkId, ParticipantId, Scope, SdpKind, SessionDescription, TrackId, TrackKind,
};
use voxmesh_core::{Error, LocalTrack, Result};

use crate::transport::{ConnectionState, PeerTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// What happened to a candidate handed to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

/// Link statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub candidates_applied: u64,
    pub candidates_buffered: u64,
    /// Offers after the first
    pub renegotiations: u64,
}

struct LinkState {
    negotiation: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    slots: [Option<TrackId>; 4],
    remote_link_id: Option<LinkId>,
    connection: ConnectionState,
    remote_tracks: BTreeMap<TrackKind, String>,
    negotiation_needed: bool,
    stats: LinkStats,
}

pub struct PeerLink {
    id: LinkId,
    scope: Scope,
    remote: ParticipantId,
    /// Remote `joinedAt` this link was created for
    remote_epoch: Epoch,
    created_at: Instant,
    transport: Arc<dyn PeerTransport>,
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<LinkState>,
    closed: CancellationToken,
}

impl PeerLink {
    #[must_use]
    pub fn new(
        id: LinkId,
        scope: Scope,
        remote: ParticipantId,
        remote_epoch: Epoch,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            id,
            scope,
            remote,
            remote_epoch,
            created_at: Instant::now(),
            transport,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(LinkState {
                negotiation: NegotiationState::Stable,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                slots: Default::default(),
                remote_link_id: None,
                connection: ConnectionState::New,
                remote_tracks: BTreeMap::new(),
                negotiation_needed: false,
                stats: LinkStats::default(),
            }),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &LinkId {
        &self.id
    }

    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub const fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    #[must_use]
    pub const fn remote_epoch(&self) -> Epoch {
        self.remote_epoch
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Link id of the remote side, once known
    #[must_use]
    pub fn remote_link_id(&self) -> Option<LinkId> {
        self.state.lock().remote_link_id.clone()
    }

    pub fn set_remote_link_id(&self, link_id: LinkId) {
        self.state.lock().remote_link_id = Some(link_id);
    }

    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.state.lock().stats.clone()
    }

    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    /// Kinds attached through this link, in attach order
    #[must_use]
    pub fn attached_kinds(&self) -> Vec<TrackKind> {
        let state = self.state.lock();
        TrackKind::ATTACH_ORDER
            .into_iter()
            .filter(|k| state.slots[k.index()].is_some())
            .collect()
    }

    #[must_use]
    pub fn attached_track(&self, kind: TrackKind) -> Option<TrackId> {
        self.state.lock().slots[kind.index()].clone()
    }

    #[must_use]
    pub fn remote_tracks(&self) -> Vec<TrackKind> {
        self.state.lock().remote_tracks.keys().copied().collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the link is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState(format!("link {} is closed", self.id)));
        }
        Ok(())
    }

    /// Request a renegotiation once the current exchange completes
    pub fn mark_negotiation_needed(&self) {
        self.state.lock().negotiation_needed = true;
    }

    /// Clear and return the pending renegotiation request
    pub fn take_negotiation_needed(&self) -> bool {
        std::mem::take(&mut self.state.lock().negotiation_needed)
    }

    /// Put `track` on its slot. Returns false when it is already there.
    pub async fn attach_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        let current = self.state.lock().slots[kind.index()].clone();
        match current {
            Some(id) if &id == track.id() => return Ok(false),
            Some(_) => self.transport.replace(kind, track).await?,
            None => self.transport.attach(kind, track).await?,
        }
        self.state.lock().slots[kind.index()] = Some(track.id().clone());
        debug!(link_id = %self.id, remote = %self.remote, %kind, "Track attached");
        Ok(true)
    }

    /// Empty the slot of `kind`. Returns false when it was already empty.
    pub async fn detach_track(&self, kind: TrackKind) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if self.state.lock().slots[kind.index()].is_none() {
            return Ok(false);
        }
        self.transport.detach(kind).await?;
        self.state.lock().slots[kind.index()] = None;
        debug!(link_id = %self.id, remote = %self.remote, %kind, "Track detached");
        Ok(true)
    }

    /// Swap the source of an occupied slot without renegotiating
    pub async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if self.state.lock().slots[kind.index()].is_none() {
            return Err(Error::InvalidState(format!("no {kind} track on link {}", self.id)));
        }
        self.transport.replace(kind, track).await?;
        self.state.lock().slots[kind.index()] = Some(track.id().clone());
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<String> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::Stable {
                // Offer again once the exchange in flight settles
                state.negotiation_needed = true;
                return Err(Error::InvalidState(format!(
                    "cannot offer on link {} in state {:?}",
                    self.id, state.negotiation
                )));
            }
        }
        let sdp = self.transport.create_offer().await?;
        let mut state = self.state.lock();
        state.negotiation = NegotiationState::HaveLocalOffer;
        state.negotiation_needed = false;
        if state.stats.offers_sent > 0 {
            state.stats.renegotiations += 1;
        }
        state.stats.offers_sent += 1;
        Ok(sdp)
    }

    pub async fn create_answer(&self) -> Result<String> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if self.negotiation_state() != NegotiationState::HaveRemoteOffer {
            return Err(Error::OutOfOrder(format!("no remote offer to answer on link {}", self.id)));
        }
        let sdp = self.transport.create_answer().await?;
        let mut state = self.state.lock();
        state.negotiation = NegotiationState::Stable;
        state.stats.answers_sent += 1;
        Ok(sdp)
    }

    /// Apply the remote description and flush buffered candidates.
    ///
    /// An answer is only accepted while a local offer is outstanding; an offer
    /// is not accepted while one is (the caller resolves glare first).
    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        let negotiation = self.negotiation_state();
        let next = match description.kind {
            SdpKind::Answer if negotiation == NegotiationState::HaveLocalOffer => NegotiationState::Stable,
            SdpKind::Answer => {
                return Err(Error::OutOfOrder(format!(
                    "answer on link {} in state {negotiation:?}",
                    self.id
                )))
            }
            SdpKind::Offer if negotiation == NegotiationState::HaveLocalOffer => {
                return Err(Error::InvalidState(format!(
                    "offer collides with outstanding offer on link {}",
                    self.id
                )))
            }
            SdpKind::Offer => NegotiationState::HaveRemoteOffer,
        };

        self.transport.set_remote_description(description).await?;

        let pending = {
            let mut state = self.state.lock();
            state.negotiation = next;
            state.remote_description_set = true;
            std::mem::take(&mut state.pending_candidates)
        };
        if !pending.is_empty() {
            debug!(link_id = %self.id, count = pending.len(), "Flushing buffered candidates");
        }
        for candidate in pending {
            match self.transport.add_ice_candidate(candidate).await {
                Ok(()) => self.state.lock().stats.candidates_applied += 1,
                Err(e) => warn!(link_id = %self.id, error = %e, "Buffered candidate rejected"),
            }
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if !state.remote_description_set {
                state.pending_candidates.push(candidate);
                state.stats.candidates_buffered += 1;
                return Ok(CandidateDisposition::Buffered);
            }
        }
        self.transport.add_ice_candidate(candidate).await?;
        self.state.lock().stats.candidates_applied += 1;
        Ok(CandidateDisposition::Applied)
    }

    /// Drop an outstanding local offer (polite side of a glare)
    pub async fn rollback(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if self.negotiation_state() != NegotiationState::HaveLocalOffer {
            return Ok(());
        }
        self.transport.rollback().await?;
        let mut state = self.state.lock();
        state.negotiation = NegotiationState::Stable;
        // Whatever we wanted to offer still has to be offered
        state.negotiation_needed = true;
        Ok(())
    }

    /// Record a transport event. Returns false once the link is closed so the
    /// event is not forwarded.
    pub fn apply_event(&self, event: &TransportEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock();
        match event {
            TransportEvent::ConnectionState(connection) => state.connection = *connection,
            TransportEvent::RemoteTrack { kind, stream_id } => {
                state.remote_tracks.insert(*kind, stream_id.clone());
            }
            TransportEvent::RemoteTrackEnded { kind } => {
                state.remote_tracks.remove(kind);
            }
            TransportEvent::LocalCandidate(_) => {}
        }
        true
    }

    /// Release the transport. Safe to call repeatedly; returns true for the
    /// call that actually closed the link.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return false;
            }
            state.negotiation = NegotiationState::Closed;
            state.connection = ConnectionState::Closed;
            state.slots = Default::default();
            state.pending_candidates.clear();
            state.remote_tracks.clear();
        }
        self.closed.cancel();
        if let Err(e) = self.transport.close().await {
            warn!(link_id = %self.id, error = %e, "Transport close failed");
        }
        debug!(link_id = %self.id, remote = %self.remote, "Peer link closed");
        true
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        debug!(
            link_id = %self.id,
            remote = %self.remote,
            closed = self.closed.is_cancelled(),
            "PeerLink dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedTransportFactory;
    use crate::transport::PeerTransportFactory;
    use tokio::sync::mpsc;
    use voxmesh_core::models::ChannelId;

    async fn link_with(
        factory: &SimulatedTransportFactory,
        id: &str,
        remote: &str,
    ) -> (PeerLink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_id = LinkId::from(id);
        let transport = factory
            .create(&link_id, &ParticipantId::from(remote), tx)
            .await
            .unwrap();
        let link = PeerLink::new(
            link_id,
            Scope::Channel(ChannelId::from("42")),
            ParticipantId::from(remote),
            Epoch(1),
            transport,
        );
        (link, rx)
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let factory = SimulatedTransportFactory::new();
        let (offerer, _rx_a) = link_with(&factory, "la", "b").await;
        let (answerer, _rx_b) = link_with(&factory, "lb", "a").await;

        for i in 0..3 {
            let disposition = answerer
                .add_ice_candidate(IceCandidate::new(format!("candidate:{i}")))
                .await
                .unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        assert_eq!(answerer.pending_candidates(), 3);

        let offer = offerer.create_offer().await.unwrap();
        answerer
            .set_remote_description(SessionDescription::offer(offer))
            .await
            .unwrap();
        assert_eq!(answerer.pending_candidates(), 0);

        let applied: Vec<String> = factory
            .transport(answerer.id())
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:0", "candidate:1", "candidate:2"]);

        let late = answerer.add_ice_candidate(IceCandidate::new("candidate:3")).await.unwrap();
        assert_eq!(late, CandidateDisposition::Applied);
        assert_eq!(answerer.stats().candidates_applied, 4);
    }

    #[tokio::test]
    async fn test_answer_out_of_order_is_rejected() {
        let factory = SimulatedTransportFactory::new();
        let (link, _rx) = link_with(&factory, "la", "b").await;
        let err = link
            .set_remote_description(SessionDescription::answer("v=0\no=voxmesh-sim lb 1\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder(_)));
        assert_eq!(link.negotiation_state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_offer_answer_state_machine() {
        let factory = SimulatedTransportFactory::new();
        let (a, _rx_a) = link_with(&factory, "la", "b").await;
        let (b, _rx_b) = link_with(&factory, "lb", "a").await;

        let offer = a.create_offer().await.unwrap();
        assert_eq!(a.negotiation_state(), NegotiationState::HaveLocalOffer);
        assert!(a.create_offer().await.is_err());
        assert!(a.take_negotiation_needed());

        b.set_remote_description(SessionDescription::offer(offer)).await.unwrap();
        assert_eq!(b.negotiation_state(), NegotiationState::HaveRemoteOffer);
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(SessionDescription::answer(answer)).await.unwrap();

        assert_eq!(a.negotiation_state(), NegotiationState::Stable);
        assert_eq!(b.negotiation_state(), NegotiationState::Stable);

        a.create_offer().await.unwrap();
        assert_eq!(a.stats().renegotiations, 1);
        assert!(!a.take_negotiation_needed());
    }

    #[tokio::test]
    async fn test_rollback_requests_renegotiation() {
        let factory = SimulatedTransportFactory::new();
        let (link, _rx) = link_with(&factory, "la", "b").await;
        link.create_offer().await.unwrap();
        link.rollback().await.unwrap();
        assert_eq!(link.negotiation_state(), NegotiationState::Stable);
        assert!(link.take_negotiation_needed());
        assert!(!link.take_negotiation_needed());
    }

    #[tokio::test]
    async fn test_attach_detach_and_close() {
        let factory = SimulatedTransportFactory::new();
        let (link, _rx) = link_with(&factory, "la", "b").await;
        let voice = LocalTrack::new(TrackKind::Voice, None, "mic");
        let camera = LocalTrack::new(TrackKind::Camera, None, "cam");

        assert!(link.attach_track(TrackKind::Camera, &camera).await.unwrap());
        assert!(link.attach_track(TrackKind::Voice, &voice).await.unwrap());
        assert!(!link.attach_track(TrackKind::Voice, &voice).await.unwrap());
        assert_eq!(link.attached_kinds(), vec![TrackKind::Voice, TrackKind::Camera]);

        assert!(link.detach_track(TrackKind::Camera).await.unwrap());
        assert!(!link.detach_track(TrackKind::Camera).await.unwrap());

        assert!(link.close().await);
        assert!(!link.close().await);
        assert!(link.is_closed());
        assert!(link.attached_kinds().is_empty());
        assert!(!link.apply_event(&TransportEvent::ConnectionState(ConnectionState::Connected)));
        assert!(factory.transport(link.id()).unwrap().is_closed());
        assert!(link.create_offer().await.is_err());
    }
}
