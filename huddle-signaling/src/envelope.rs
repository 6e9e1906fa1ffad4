//! Signaling envelope
//!
//! Every message on the room channel is one [`SignalEnvelope`]: a typed
//! payload plus addressing (`from`, optional `to`, `room_id`). The channel
//! itself broadcasts to every subscriber; recipient filtering is the
//! consumer's responsibility (the peer manager ignores envelopes addressed
//! to someone else).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sdp::{IceCandidate, SessionDescription};
use crate::types::{ParticipantId, RoomId};

/// Typed payload of a signaling message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Connection offer toward `to`. Carries the offerer's display name so
    /// the receiving side can build its participant record on a first offer.
    Offer {
        description: SessionDescription,
        display_name: String,
    },
    /// Answer to a previously received offer
    Answer { description: SessionDescription },
    /// ICE candidate for an in-progress negotiation
    #[serde(rename = "ice_candidate")]
    Candidate { candidate: IceCandidate },
    /// Presence announcement broadcast to the room on join
    Join {
        display_name: String,
        audio: bool,
        video: bool,
    },
    /// Presence withdrawal broadcast to the room on leave
    Leave,
}

impl SignalPayload {
    /// Stable name of the payload kind, used for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "ice_candidate",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
        }
    }
}

/// One message in transit through the room's pub/sub channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: ParticipantId,
    /// `None` addresses the whole room (presence announcements)
    pub to: Option<ParticipantId>,
    pub room_id: RoomId,
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub timestamp: DateTime<Utc>,
}

impl SignalEnvelope {
    /// Build a directed envelope
    pub fn to_peer(
        room_id: RoomId,
        from: ParticipantId,
        to: ParticipantId,
        payload: SignalPayload,
    ) -> Self {
        Self {
            from,
            to: Some(to),
            room_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build a room-wide broadcast envelope
    pub fn broadcast(room_id: RoomId, from: ParticipantId, payload: SignalPayload) -> Self {
        Self {
            from,
            to: None,
            room_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Whether this envelope should be consumed by `local`
    #[must_use]
    pub fn is_addressed_to(&self, local: &ParticipantId) -> bool {
        match &self.to {
            Some(to) => to == local,
            None => true,
        }
    }
}
