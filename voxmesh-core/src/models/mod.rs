pub mod id;
pub mod media;
pub mod membership;
pub mod presence;
pub mod signal;

pub use id::{CallId, ChannelId, LinkId, ParticipantId, SignalId, TrackId};
pub use media::{
    CaptureWindow, DeviceInfo, DeviceKind, DisplayCaptureOptions, LoopbackAudio, LoopbackMode,
    MediaKind, TrackKind,
};
pub use membership::{Epoch, MemberFlags, Membership, Scope};
pub use presence::{PresenceRecord, PresenceStatus, RelayStatus};
pub use signal::{IceCandidate, SdpKind, SessionDescription, Signal, SignalKind, SignalPayload};
