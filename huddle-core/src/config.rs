//! Call configuration
//!
//! Immutable session parameters, fixed at construction and never mutated
//! after `initialize`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::media::MediaConstraints;
use crate::types::{ParticipantId, RoomId};

/// ICE server descriptor (STUN/TURN) handed to the peer transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// TURN username
    pub username: Option<String>,
    /// TURN credential
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Immutable session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Room to join
    pub room_id: RoomId,
    /// Local participant id
    pub local_id: ParticipantId,
    /// Local display name, announced to the room
    pub display_name: String,
    /// Capture audio on initialize
    pub audio: bool,
    /// Capture video on initialize
    pub video: bool,
    /// ICE servers for NAT traversal
    pub ice_servers: Vec<IceServerConfig>,
    /// Capture constraints, passed through to media acquisition unmodified
    pub constraints: MediaConstraints,
    /// Stats poll interval in milliseconds
    pub stats_interval_ms: u64,
    /// Recording chunk interval in milliseconds
    pub recording_timeslice_ms: u64,
    /// Preferred recording mime types, descending priority
    pub recording_mime_candidates: Vec<String>,
}

impl CallConfig {
    pub fn new(
        room_id: impl Into<RoomId>,
        local_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            local_id: local_id.into(),
            display_name: display_name.into(),
            audio: true,
            video: true,
            ice_servers: default_ice_servers(),
            constraints: MediaConstraints::default(),
            stats_interval_ms: 2_000,
            recording_timeslice_ms: 1_000,
            recording_mime_candidates: default_mime_candidates(),
        }
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    #[must_use]
    pub fn recording_timeslice(&self) -> Duration {
        Duration::from_millis(self.recording_timeslice_ms)
    }
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

fn default_mime_candidates() -> Vec<String> {
    [
        "video/webm;codecs=vp9,opus",
        "video/webm;codecs=vp8,opus",
        "video/webm",
        "audio/webm",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
