//! Session description and ICE candidate wire types
//!
//! These are the payloads carried by the signaling channel during connection
//! negotiation. The engine treats SDP bodies as opaque strings; only the
//! description type participates in negotiation decisions.

use serde::{Deserialize, Serialize};

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description type (offer, answer, pranswer, rollback)
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_type() {
        assert_eq!(SdpType::Offer.as_str(), "offer");
        assert_ne!(SdpType::Offer, SdpType::Answer);
    }

    #[test]
    fn test_session_description_serialization() {
        let desc = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n...");

        let json = serde_json::to_string(&desc).unwrap();
        let deserialized: SessionDescription = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.sdp_type, SdpType::Offer);
        assert_eq!(deserialized.sdp, desc.sdp);
    }

    #[test]
    fn test_ice_candidate_round_trip() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        let json = serde_json::to_string(&candidate).unwrap();
        let deserialized: IceCandidate = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, candidate);
    }
}
