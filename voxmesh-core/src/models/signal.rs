use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::{LinkId, ParticipantId, SignalId};
use super::membership::{Epoch, Scope};
use crate::error::Result;

/// A trickled ICE candidate, opaque apart from its addressing fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Negotiation payload. Closed set; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// A negotiation message routed through the relay.
///
/// `epoch` is the sender's session epoch and `link_id` the sender's link; the
/// receiver uses both to reject signals from superseded sessions or links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub scope: Scope,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub epoch: Epoch,
    pub link_id: LinkId,
    pub payload: SignalPayload,
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    #[must_use]
    pub fn new(
        scope: Scope,
        from: ParticipantId,
        to: ParticipantId,
        epoch: Epoch,
        link_id: LinkId,
        payload: SignalPayload,
    ) -> Self {
        Self {
            id: SignalId::new(),
            scope,
            from,
            to,
            epoch,
            link_id,
            payload,
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Encode for a relay that carries text payloads
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description handed to a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::id::ChannelId;

    fn sample(payload: SignalPayload) -> Signal {
        Signal::new(
            Scope::Channel(ChannelId::from("42")),
            ParticipantId::from("alice"),
            ParticipantId::from("bob"),
            Epoch(1_700_000_000_000),
            LinkId::from("link-a"),
            payload,
        )
    }

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let signal = sample(SignalPayload::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        let value: serde_json::Value = serde_json::from_str(&signal.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["kind"], "ice_candidate");
        assert_eq!(value["payload"]["sdp_mid"], "0");
        assert_eq!(value["scope"]["type"], "channel");
        assert_eq!(signal.kind(), SignalKind::IceCandidate);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = sample(SignalPayload::Offer { sdp: "v=0".to_string() })
            .to_json()
            .unwrap()
            .replace("\"offer\"", "\"renegotiate\"");
        assert!(Signal::from_json(&raw).is_err());
    }

    #[test]
    fn test_decode_offer() {
        let original = sample(SignalPayload::Offer { sdp: "v=0".to_string() });
        let decoded = Signal::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded.payload, SignalPayload::Offer { sdp: "v=0".to_string() });
        assert_eq!(decoded.epoch, original.epoch);
    }
}
