//! The opaque transport under a peer link.
//!
//! A transport owns one bidirectional media connection with four outbound
//! slots. It reports local ICE candidates, remote track arrivals and
//! connection state through the event sender handed to the factory.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use voxmesh_core::models::{IceCandidate, LinkId, ParticipantId, SessionDescription, TrackKind};
use voxmesh_core::{LocalTrack, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { kind: TrackKind, stream_id: String },
    RemoteTrackEnded { kind: TrackKind },
    ConnectionState(ConnectionState),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Occupy the slot of `kind` with `track`
    async fn attach(&self, kind: TrackKind, track: &LocalTrack) -> Result<()>;

    /// Empty the slot of `kind`
    async fn detach(&self, kind: TrackKind) -> Result<()>;

    /// Swap the source of an occupied slot without renegotiation
    async fn replace(&self, kind: TrackKind, track: &LocalTrack) -> Result<()>;

    /// Create an offer, apply it locally and return its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Create an answer to the applied remote offer, apply it locally and
    /// return its SDP
    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Discard an outstanding local offer
    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        link_id: &LinkId,
        remote: &ParticipantId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
