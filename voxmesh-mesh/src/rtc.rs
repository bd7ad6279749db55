//! `PeerTransport` over a real WebRTC peer connection.
//!
//! Each occupied slot is backed by one `TrackLocalStaticRTP` whose id is the
//! slot kind, so the remote side can tell voice from soundpad and screen from
//! camera. Capture pipelines write RTP into the track returned by
//! [`WebRtcTransport::rtp_track`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use voxmesh_core::config::MeshConfig;
use voxmesh_core::models::{
    IceCandidate, LinkId, MediaKind, ParticipantId, SdpKind, SessionDescription, TrackKind,
};
use voxmesh_core::{Error, LocalTrack, Result};

use crate::transport::{ConnectionState, PeerTransport, PeerTransportFactory, TransportEvent};

fn transport_error(e: webrtc::Error) -> Error {
    Error::Transport(e.to_string())
}

fn negotiation_error(e: webrtc::Error) -> Error {
    Error::Negotiation(e.to_string())
}

const fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind.media_kind() {
        MediaKind::Audio => MIME_TYPE_OPUS,
        MediaKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        ..Default::default()
    }
}

struct Slot {
    sender: Arc<RTCRtpSender>,
    rtp: Arc<TrackLocalStaticRTP>,
}

pub struct WebRtcTransport {
    link_id: LinkId,
    pc: Arc<RTCPeerConnection>,
    slots: DashMap<TrackKind, Slot>,
}

impl WebRtcTransport {
    async fn connect(
        api: &API,
        config: RTCConfiguration,
        link_id: LinkId,
        remote: &ParticipantId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(transport_error)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        let peer = remote.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let kind = track.id().parse::<TrackKind>().unwrap_or(match track.kind() {
                    RTPCodecType::Video => TrackKind::Camera,
                    _ => TrackKind::Voice,
                });
                info!(remote = %peer, %kind, ssrc = track.ssrc(), "Remote track received");
                let _ = tx.send(TransportEvent::RemoteTrack {
                    kind,
                    stream_id: track.stream_id(),
                });

                // Keep interceptors fed until the remote stops sending
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!(remote = %peer, %kind, "Remote track ended");
                    let _ = tx.send(TransportEvent::RemoteTrackEnded { kind });
                });
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            if let Some(state) = map_state(state) {
                let _ = tx.send(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        Ok(Self {
            link_id,
            pc,
            slots: DashMap::new(),
        })
    }

    fn new_rtp_track(&self, kind: TrackKind, track: &LocalTrack) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            codec_for(kind),
            kind.as_str().to_string(),
            format!("{}-{}", self.link_id, track.id()),
        ))
    }

    /// RTP sink of the slot of `kind`, if occupied
    #[must_use]
    pub fn rtp_track(&self, kind: TrackKind) -> Option<Arc<TrackLocalStaticRTP>> {
        self.slots.get(&kind).map(|slot| Arc::clone(&slot.rtp))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        if self.slots.contains_key(&kind) {
            return Err(Error::InvalidState(format!("{kind} slot already occupied")));
        }
        let rtp = self.new_rtp_track(kind, track);
        let sender = self
            .pc
            .add_track(Arc::clone(&rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_error)?;
        self.slots.insert(kind, Slot { sender, rtp });
        Ok(())
    }

    async fn detach(&self, kind: TrackKind) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(&kind) else {
            return Ok(());
        };
        self.pc.remove_track(&slot.sender).await.map_err(transport_error)
    }

    async fn replace(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let sender = match self.slots.get(&kind) {
            Some(slot) => Arc::clone(&slot.sender),
            None => return Err(Error::InvalidState(format!("{kind} slot is empty"))),
        };
        let rtp = self.new_rtp_track(kind, track);
        sender
            .replace_track(Some(Arc::clone(&rtp) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(transport_error)?;
        self.slots.insert(kind, Slot { sender, rtp });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_error)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_error)?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(transport_error)
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(negotiation_error)
    }

    async fn close(&self) -> Result<()> {
        self.slots.clear();
        self.pc.close().await.map_err(transport_error)
    }
}

/// Builds peer connections sharing one media engine and ICE configuration
pub struct WebRtcTransportFactory {
    api: API,
    config: RTCConfiguration,
    transports: DashMap<LinkId, Arc<WebRtcTransport>>,
}

impl WebRtcTransportFactory {
    pub fn new(mesh: &MeshConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(transport_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: mesh.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            transports: DashMap::new(),
        })
    }

    /// Live transport of `link_id`, for wiring capture pipelines
    #[must_use]
    pub fn transport(&self, link_id: &LinkId) -> Option<Arc<WebRtcTransport>> {
        self.transports.get(link_id).map(|t| Arc::clone(t.value()))
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        link_id: &LinkId,
        remote: &ParticipantId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(
            WebRtcTransport::connect(&self.api, self.config.clone(), link_id.clone(), remote, events).await?,
        );
        // Closed transports are not worth keeping around
        self.transports
            .retain(|_, t| t.pc.connection_state() != RTCPeerConnectionState::Closed);
        self.transports.insert(link_id.clone(), Arc::clone(&transport));
        debug!(link_id = %link_id, remote = %remote, "WebRTC transport created");
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_follows_media_kind() {
        assert_eq!(codec_for(TrackKind::Voice).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Soundpad).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Screen).mime_type, MIME_TYPE_VP8);
        assert_eq!(codec_for(TrackKind::Camera).mime_type, MIME_TYPE_VP8);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_carries_attached_slots() {
        let factory = WebRtcTransportFactory::new(&MeshConfig {
            ice_servers: Vec::new(),
            ..MeshConfig::default()
        })
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&LinkId::from("l1"), &ParticipantId::from("bob"), tx)
            .await
            .unwrap();

        let voice = LocalTrack::new(TrackKind::Voice, Some("mic".to_string()), "Mic");
        transport.attach(TrackKind::Voice, &voice).await.unwrap();
        assert!(transport.attach(TrackKind::Voice, &voice).await.is_err());

        let sdp = transport.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(factory.transport(&LinkId::from("l1")).unwrap().rtp_track(TrackKind::Voice).is_some());

        transport.close().await.unwrap();
    }
}
