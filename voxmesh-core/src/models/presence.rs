use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::ParticipantId;

/// Liveness status of a participant. Derived, never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Idle,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }

    /// Away and idle participants are still connected
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub participant_id: ParticipantId,
    pub last_seen_at: DateTime<Utc>,
    pub status: PresenceStatus,
}

impl PresenceRecord {
    #[must_use]
    pub fn new(participant_id: ParticipantId, status: PresenceStatus) -> Self {
        Self {
            participant_id,
            last_seen_at: Utc::now(),
            status,
        }
    }
}

/// Subscription state of the realtime relay channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl RelayStatus {
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        !matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Subscribed => "SUBSCRIBED",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::TimedOut => "TIMED_OUT",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}
