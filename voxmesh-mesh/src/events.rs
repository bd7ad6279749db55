use serde::Serialize;
use std::fmt;
use voxmesh_core::models::{Epoch, LinkId, MemberFlags, ParticipantId, Scope, TrackKind};

use crate::transport::ConnectionState;

/// Lifecycle of the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Active,
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

/// A remote participant of the active scope, as shown to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteParticipant {
    pub participant_id: ParticipantId,
    pub epoch: Epoch,
    pub flags: MemberFlags,
    pub connection: Option<ConnectionState>,
    pub remote_tracks: Vec<TrackKind>,
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        scope: Option<Scope>,
    },
    ParticipantJoined {
        participant_id: ParticipantId,
        epoch: Epoch,
    },
    ParticipantUpdated {
        participant_id: ParticipantId,
        flags: MemberFlags,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    PeerConnected {
        participant_id: ParticipantId,
        link_id: LinkId,
    },
    RemoteTrackAdded {
        participant_id: ParticipantId,
        kind: TrackKind,
        stream_id: String,
    },
    RemoteTrackRemoved {
        participant_id: ParticipantId,
        kind: TrackKind,
    },
    LocalTrackChanged {
        kind: TrackKind,
        active: bool,
    },
    MuteChanged(bool),
    DeafenChanged(bool),
    /// A capture source failed or was revoked; carries the user-facing message
    MediaError {
        kind: TrackKind,
        message: String,
    },
    LinkFailed {
        participant_id: ParticipantId,
        reason: String,
    },
    /// Sessions were force-left after the relay stayed unreachable
    ConnectionLost {
        reason: String,
    },
}

/// Why an inbound signal was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoActiveSession,
    ScopeMismatch,
    NotAddressed,
    StaleEpoch,
    StaleLink,
    /// Answer with no outstanding local offer
    OutOfOrder,
    /// Offer collided with our own and we are the impolite side
    Glare,
    /// The session or link changed while the signal was processed
    Superseded,
    NegotiationFailed,
}

/// Result of handling one inbound signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// ICE candidate held until the remote description is known
    Buffered,
    Dropped(DropReason),
}

impl SignalOutcome {
    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}
