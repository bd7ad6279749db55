use std::fmt;
use thiserror::Error;

use crate::models::TrackKind;

/// Why a capture source could not be acquired or was lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaErrorReason {
    PermissionDenied,
    DeviceBusy,
    DeviceNotFound,
    /// Revoked by the OS or browser outside of our control
    Revoked,
    Other(String),
}

impl fmt::Display for MediaErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::DeviceBusy => f.write_str("device is busy"),
            Self::DeviceNotFound => f.write_str("device not found"),
            Self::Revoked => f.write_str("capture revoked"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media acquisition failed for {kind}: {reason}")]
    MediaAcquisition {
        kind: TrackKind,
        reason: MediaErrorReason,
    },

    #[error("Signal scope {got} does not match active scope {expected}")]
    ScopeMismatch { expected: String, got: String },

    #[error("Stale epoch: {0}")]
    StaleEpoch(String),

    #[error("Out-of-order negotiation: {0}")]
    OutOfOrder(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    #[must_use]
    pub const fn media(kind: TrackKind, reason: MediaErrorReason) -> Self {
        Self::MediaAcquisition { kind, reason }
    }

    /// Errors the UI should show. Scope mismatches, stale epochs and
    /// out-of-order negotiation are expected under races and stay in logs.
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::MediaAcquisition { .. } | Self::Relay(_) | Self::Timeout(_) | Self::InvalidState(_)
        )
    }

    /// Short message for the user, if this error should be shown
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::MediaAcquisition { kind, reason } => match reason {
                MediaErrorReason::PermissionDenied => {
                    Some(format!("Access to the {kind} source was denied"))
                }
                MediaErrorReason::DeviceBusy => {
                    Some(format!("The {kind} device is in use by another application"))
                }
                MediaErrorReason::DeviceNotFound => Some(format!("No {kind} device was found")),
                MediaErrorReason::Revoked => Some(format!("The {kind} capture was stopped")),
                MediaErrorReason::Other(msg) => Some(format!("Could not start {kind}: {msg}")),
            },
            Self::Relay(_) | Self::Timeout(_) => Some("Connection lost".to_string()),
            Self::InvalidState(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let media = Error::media(TrackKind::Voice, MediaErrorReason::PermissionDenied);
        assert!(media.is_user_facing());
        assert_eq!(
            media.user_message().as_deref(),
            Some("Access to the voice source was denied")
        );

        let mismatch = Error::ScopeMismatch {
            expected: "channel:1".to_string(),
            got: "channel:2".to_string(),
        };
        assert!(!mismatch.is_user_facing());
        assert!(mismatch.user_message().is_none());
        assert!(!Error::OutOfOrder("answer in stable".to_string()).is_user_facing());
    }

    #[test]
    fn test_display() {
        let err = Error::media(TrackKind::Camera, MediaErrorReason::DeviceBusy);
        assert_eq!(err.to_string(), "Media acquisition failed for camera: device is busy");
    }
}
