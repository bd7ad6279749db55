use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::{CallId, ChannelId, ParticipantId};

/// Session scope a membership, a signal or a peer link belongs to.
///
/// Voice channels and direct calls share the same membership model; at most
/// one scope is active per local participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Channel(ChannelId),
    Call(CallId),
}

impl Scope {
    #[must_use]
    pub const fn is_channel(&self) -> bool {
        matches!(self, Self::Channel(_))
    }

    #[must_use]
    pub const fn is_call(&self) -> bool {
        matches!(self, Self::Call(_))
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Channel(_) => "channel",
            Self::Call(_) => "call",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::Call(id) => write!(f, "call:{id}"),
        }
    }
}

/// Per-participant session version (`joinedAt`, Unix milliseconds).
///
/// Every join mints a new epoch strictly greater than the previous one so
/// successive sessions of the same identity are always distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub i64);

impl Epoch {
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Current time, bumped past `previous` when the clock has not advanced
    #[must_use]
    pub fn next_after(previous: Option<Self>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if prev >= now => Self(prev.0 + 1),
            _ => now,
        }
    }

    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability flags shared with other participants for their UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberFlags {
    pub muted: bool,
    pub deafened: bool,
    pub video: bool,
    pub screen_sharing: bool,
}

/// A row of the channel/call membership table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub scope: Scope,
    pub participant_id: ParticipantId,
    pub joined_at: Epoch,
    #[serde(default)]
    pub flags: MemberFlags,
}

impl Membership {
    #[must_use]
    pub const fn new(scope: Scope, participant_id: ParticipantId, joined_at: Epoch, flags: MemberFlags) -> Self {
        Self {
            scope,
            participant_id,
            joined_at,
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_strictly_increases() {
        let far_future = Epoch(Utc::now().timestamp_millis() + 60_000);
        let next = Epoch::next_after(Some(far_future));
        assert_eq!(next, Epoch(far_future.0 + 1));

        let past = Epoch(1);
        assert!(Epoch::next_after(Some(past)) > past);
        assert!(Epoch::next_after(None).as_millis() > 0);
    }

    #[test]
    fn test_scope_display_and_serde() {
        let scope = Scope::Channel(ChannelId::from("42"));
        assert_eq!(scope.to_string(), "channel:42");
        assert!(scope.is_channel());

        let json = serde_json::to_string(&scope).unwrap();
        assert_eq!(json, r#"{"type":"channel","id":"42"}"#);
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);

        let call = Scope::Call(CallId::from("c1"));
        assert_ne!(call, Scope::Channel(ChannelId::from("c1")));
        assert_eq!(call.kind(), "call");
    }
}
