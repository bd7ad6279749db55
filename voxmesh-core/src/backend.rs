//! Seams to the external collaborators: the membership table, the signal
//! relay, the presence channel and the platform capture devices.
//!
//! Observation is push based. Each `watch_*`/`subscribe_*` call hands back a
//! fresh unbounded receiver; dropping it unsubscribes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::devices::LocalTrack;
use crate::error::Result;
use crate::models::{
    CaptureWindow, DeviceInfo, DisplayCaptureOptions, MemberFlags, Membership, ParticipantId,
    PresenceRecord, RelayStatus, Scope, Signal, TrackKind,
};

/// Row-level change of the membership table for one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Inserted(Membership),
    Updated(Membership),
    Deleted {
        scope: Scope,
        participant_id: ParticipantId,
    },
}

impl MembershipChange {
    #[must_use]
    pub const fn participant_id(&self) -> &ParticipantId {
        match self {
            Self::Inserted(m) | Self::Updated(m) => &m.participant_id,
            Self::Deleted { participant_id, .. } => participant_id,
        }
    }
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert or overwrite the row for `(scope, participant_id)`
    async fn insert_membership(&self, membership: Membership) -> Result<()>;

    /// Deleting a missing row is not an error
    async fn delete_membership(&self, scope: &Scope, participant_id: &ParticipantId) -> Result<()>;

    async fn update_membership(
        &self,
        scope: &Scope,
        participant_id: &ParticipantId,
        flags: MemberFlags,
    ) -> Result<()>;

    async fn list_memberships(&self, scope: &Scope) -> Result<Vec<Membership>>;

    async fn watch_memberships(&self, scope: &Scope) -> Result<mpsc::UnboundedReceiver<MembershipChange>>;
}

/// Durable pub/sub keyed by recipient. Delivery is at-least-once.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    async fn send_signal(&self, signal: Signal) -> Result<()>;

    /// Signals addressed to `participant_id`, in any scope
    async fn subscribe_signals(&self, participant_id: &ParticipantId) -> Result<mpsc::UnboundedReceiver<Signal>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Full snapshot of the presence set
    Sync(Vec<PresenceRecord>),
    Join(PresenceRecord),
    Leave(ParticipantId),
    /// Subscription state of the underlying realtime channel
    Status(RelayStatus),
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn track_presence(&self, record: PresenceRecord) -> Result<()>;

    async fn untrack_presence(&self, participant_id: &ParticipantId) -> Result<()>;

    /// Refresh `last_seen_at` for the participant
    async fn heartbeat(&self, participant_id: &ParticipantId) -> Result<()>;

    async fn subscribe_presence(&self) -> Result<mpsc::UnboundedReceiver<PresenceEvent>>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_audio_input(&self, device_id: Option<&str>, noise_suppression: bool) -> Result<LocalTrack>;

    async fn acquire_video_input(&self, device_id: Option<&str>) -> Result<LocalTrack>;

    async fn acquire_display_capture(&self, options: &DisplayCaptureOptions) -> Result<LocalTrack>;

    /// Soundpad playback is generated locally and needs no device
    async fn create_soundpad_track(&self) -> Result<LocalTrack> {
        Ok(LocalTrack::new(TrackKind::Soundpad, None, "Soundpad"))
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Windows eligible for capture; empty on platforms without an enumerator
    async fn list_capture_windows(&self) -> Result<Vec<CaptureWindow>> {
        Ok(Vec::new())
    }
}
