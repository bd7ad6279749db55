//! In-process transport for tests and the demo.
//!
//! The SDP is a minimal text blob naming the sending link, a version and the
//! slots currently attached:
//!
//! ```text
//! v=0
//! o=voxmesh-sim <link-id> <version>
//! a=tracks:voice,camera
//! ```
//!
//! Applying a remote description diffs the advertised kinds against the
//! previous one and reports remote track arrivals and departures, the way a
//! real stack fires track events after negotiation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use voxmesh_core::models::{IceCandidate, LinkId, ParticipantId, SdpKind, SessionDescription, TrackId, TrackKind};
use voxmesh_core::{Error, LocalTrack, Result};

use crate::transport::{ConnectionState, PeerTransport, PeerTransportFactory, TransportEvent};

const SDP_ORIGIN: &str = "o=voxmesh-sim";
const SDP_TRACKS: &str = "a=tracks:";

/// Faults shared by every transport of a factory
#[derive(Default)]
struct Faults {
    fail_replace: AtomicBool,
    fail_offers: AtomicBool,
}

pub struct SimulatedTransport {
    link_id: LinkId,
    remote: ParticipantId,
    events: mpsc::UnboundedSender<TransportEvent>,
    faults: Arc<Faults>,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    slots: [Option<TrackId>; 4],
    version: u64,
    has_local_description: bool,
    has_remote_description: bool,
    remote_offer_pending: bool,
    remote_kinds: BTreeSet<TrackKind>,
    applied_candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

/// What a parsed simulated SDP advertises
struct ParsedSdp {
    link_id: String,
    kinds: BTreeSet<TrackKind>,
}

fn parse_sdp(sdp: &str) -> Result<ParsedSdp> {
    let mut lines = sdp.lines();
    if lines.next() != Some("v=0") {
        return Err(Error::Negotiation("malformed session description".to_string()));
    }
    let mut link_id = None;
    let mut kinds = BTreeSet::new();
    for line in lines {
        if let Some(origin) = line.strip_prefix(SDP_ORIGIN) {
            link_id = origin.split_whitespace().next().map(str::to_string);
        } else if let Some(list) = line.strip_prefix(SDP_TRACKS) {
            for kind in list.split(',').filter(|k| !k.is_empty()) {
                kinds.insert(kind.parse::<TrackKind>().map_err(Error::Negotiation)?);
            }
        }
    }
    let link_id = link_id.ok_or_else(|| Error::Negotiation("session description has no origin".to_string()))?;
    Ok(ParsedSdp { link_id, kinds })
}

impl SimulatedTransport {
    fn emit(&self, event: TransportEvent) {
        // The link drops its receiver on close
        let _ = self.events.send(event);
    }

    fn check_open(&self, state: &SimState) -> Result<()> {
        if state.closed {
            return Err(Error::Transport(format!("transport {} is closed", self.link_id)));
        }
        Ok(())
    }

    fn render_sdp(&self, state: &SimState) -> String {
        let kinds: Vec<&str> = TrackKind::ATTACH_ORDER
            .iter()
            .filter(|k| state.slots[k.index()].is_some())
            .map(TrackKind::as_str)
            .collect();
        format!(
            "v=0\n{SDP_ORIGIN} {} {}\n{SDP_TRACKS}{}\n",
            self.link_id,
            state.version,
            kinds.join(",")
        )
    }

    fn local_candidate(&self, state: &SimState) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.link_id,
                40_000 + state.version
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Connected once both sides of the first exchange are applied
    fn maybe_connect(&self, state: &mut SimState) -> bool {
        if !state.connected && state.has_local_description && state.has_remote_description {
            state.connected = true;
            return true;
        }
        false
    }

    /// Candidates applied so far, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Kinds currently occupying a slot
    #[must_use]
    pub fn attached_kinds(&self) -> Vec<TrackKind> {
        let state = self.state.lock();
        TrackKind::ATTACH_ORDER
            .into_iter()
            .filter(|k| state.slots[k.index()].is_some())
            .collect()
    }

    #[must_use]
    pub fn remote_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().remote_kinds.iter().copied().collect()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    async fn attach(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let slot = &mut state.slots[kind.index()];
        if slot.is_some() {
            return Err(Error::InvalidState(format!("{kind} slot already occupied")));
        }
        *slot = Some(track.id().clone());
        Ok(())
    }

    async fn detach(&self, kind: TrackKind) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.slots[kind.index()] = None;
        Ok(())
    }

    async fn replace(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        if self.faults.fail_replace.load(Ordering::Acquire) {
            return Err(Error::Transport("replace not supported".to_string()));
        }
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let slot = &mut state.slots[kind.index()];
        if slot.is_none() {
            return Err(Error::InvalidState(format!("{kind} slot is empty")));
        }
        *slot = Some(track.id().clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        if self.faults.fail_offers.load(Ordering::Acquire) {
            return Err(Error::Negotiation("offer creation failed".to_string()));
        }
        let (sdp, candidate, connected) = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            state.version += 1;
            state.has_local_description = true;
            let connected = self.maybe_connect(&mut state);
            (self.render_sdp(&state), self.local_candidate(&state), connected)
        };
        self.emit(TransportEvent::LocalCandidate(candidate));
        if connected {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let (sdp, candidate, connected) = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            if !state.remote_offer_pending {
                return Err(Error::Negotiation("no remote offer to answer".to_string()));
            }
            state.remote_offer_pending = false;
            state.version += 1;
            state.has_local_description = true;
            let connected = self.maybe_connect(&mut state);
            (self.render_sdp(&state), self.local_candidate(&state), connected)
        };
        self.emit(TransportEvent::LocalCandidate(candidate));
        if connected {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(sdp)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let parsed = parse_sdp(&description.sdp)?;
        let (added, removed, connected) = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            let added: Vec<TrackKind> = parsed.kinds.difference(&state.remote_kinds).copied().collect();
            let removed: Vec<TrackKind> = state.remote_kinds.difference(&parsed.kinds).copied().collect();
            state.remote_kinds = parsed.kinds;
            state.has_remote_description = true;
            state.remote_offer_pending = description.kind == SdpKind::Offer;
            let connected = self.maybe_connect(&mut state);
            (added, removed, connected)
        };

        debug!(
            link_id = %self.link_id,
            remote_link = %parsed.link_id,
            ?added,
            ?removed,
            "Simulated remote description applied"
        );
        for kind in added {
            self.emit(TransportEvent::RemoteTrack {
                kind,
                stream_id: format!("{}-{kind}", parsed.link_id),
            });
        }
        for kind in removed {
            self.emit(TransportEvent::RemoteTrackEnded { kind });
        }
        if connected {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !state.has_remote_description {
            return Err(Error::Negotiation("candidate before remote description".to_string()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !state.connected {
            state.has_local_description = false;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.slots = Default::default();
        Ok(())
    }
}

/// Factory keeping a registry of the transports it made, for inspection
#[derive(Default)]
pub struct SimulatedTransportFactory {
    transports: DashMap<LinkId, Arc<SimulatedTransport>>,
    faults: Arc<Faults>,
    fail_create: AtomicBool,
    created: AtomicUsize,
}

impl SimulatedTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `replace` fail so callers fall back to detach and attach
    pub fn set_fail_replace(&self, enabled: bool) {
        self.faults.fail_replace.store(enabled, Ordering::Release);
    }

    /// Make `create_offer` fail on every transport
    pub fn set_fail_offers(&self, enabled: bool) {
        self.faults.fail_offers.store(enabled, Ordering::Release);
    }

    pub fn set_fail_create(&self, enabled: bool) {
        self.fail_create.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn transport(&self, link_id: &LinkId) -> Option<Arc<SimulatedTransport>> {
        self.transports.get(link_id).map(|t| Arc::clone(t.value()))
    }

    /// Every transport created towards `remote`, open or closed
    #[must_use]
    pub fn transports_to(&self, remote: &ParticipantId) -> Vec<Arc<SimulatedTransport>> {
        self.transports
            .iter()
            .filter(|t| t.remote() == remote)
            .map(|t| Arc::clone(t.value()))
            .collect()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PeerTransportFactory for SimulatedTransportFactory {
    async fn create(
        &self,
        link_id: &LinkId,
        remote: &ParticipantId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        if self.fail_create.load(Ordering::Acquire) {
            return Err(Error::Transport("transport creation failed".to_string()));
        }
        let transport = Arc::new(SimulatedTransport {
            link_id: link_id.clone(),
            remote: remote.clone(),
            events,
            faults: Arc::clone(&self.faults),
            state: Mutex::new(SimState::default()),
        });
        self.transports.insert(link_id.clone(), Arc::clone(&transport));
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let factory = SimulatedTransportFactory::new();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = factory
            .create(&LinkId::from("la"), &ParticipantId::from("b"), a_tx)
            .await
            .unwrap();
        let b = factory
            .create(&LinkId::from("lb"), &ParticipantId::from("a"), b_tx)
            .await
            .unwrap();
        (a, a_rx, b, b_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_reports_tracks_and_connects() {
        let (a, mut a_rx, b, mut b_rx) = pair().await;
        a.attach(TrackKind::Voice, &LocalTrack::new(TrackKind::Voice, None, "mic"))
            .await
            .unwrap();
        a.attach(TrackKind::Camera, &LocalTrack::new(TrackKind::Camera, None, "cam"))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(offer.contains("a=tracks:voice,camera"));

        b.set_remote_description(SessionDescription::offer(offer)).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(SessionDescription::answer(answer)).await.unwrap();

        let b_events = drain(&mut b_rx);
        assert!(b_events.contains(&TransportEvent::RemoteTrack {
            kind: TrackKind::Camera,
            stream_id: "la-camera".to_string(),
        }));
        assert!(b_events.contains(&TransportEvent::ConnectionState(ConnectionState::Connected)));
        assert!(drain(&mut a_rx).contains(&TransportEvent::ConnectionState(ConnectionState::Connected)));
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let (_a, _a_rx, b, _b_rx) = pair().await;
        assert!(b.add_ice_candidate(IceCandidate::new("candidate:1")).await.is_err());
    }

    #[tokio::test]
    async fn test_renegotiation_reports_removed_track() {
        let (a, _a_rx, b, mut b_rx) = pair().await;
        a.attach(TrackKind::Screen, &LocalTrack::new(TrackKind::Screen, None, "screen"))
            .await
            .unwrap();
        b.set_remote_description(SessionDescription::offer(a.create_offer().await.unwrap()))
            .await
            .unwrap();
        a.set_remote_description(SessionDescription::answer(b.create_answer().await.unwrap()))
            .await
            .unwrap();
        drain(&mut b_rx);

        a.detach(TrackKind::Screen).await.unwrap();
        b.set_remote_description(SessionDescription::offer(a.create_offer().await.unwrap()))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![TransportEvent::RemoteTrackEnded { kind: TrackKind::Screen }]
        );
    }

    #[test]
    fn test_malformed_sdp_rejected() {
        assert!(parse_sdp("hello").is_err());
        assert!(parse_sdp("v=0\na=tracks:voice\n").is_err());
        assert!(parse_sdp("v=0\no=voxmesh-sim l1 1\na=tracks:kazoo\n").is_err());
    }
}
