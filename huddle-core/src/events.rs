//! Outbound engine events
//!
//! One typed event enum delivered through a single broadcast channel, so
//! consumers pattern-match exhaustively instead of subscribing to
//! stringly-typed event names.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;
use crate::stats::{NetworkQuality, WebRtcStats};
use crate::transport::PeerConnectionState;
use crate::types::{ParticipantId, StreamId};

/// Everything the engine reports to its consumer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// A remote participant's stream became available
    StreamAdded {
        participant_id: ParticipantId,
        stream_id: StreamId,
        timestamp: DateTime<Utc>,
    },

    /// A remote participant's stream went away
    StreamRemoved {
        participant_id: ParticipantId,
        stream_id: StreamId,
        timestamp: DateTime<Utc>,
    },

    /// A peer connection reached the connected state
    PeerConnected {
        participant_id: ParticipantId,
        timestamp: DateTime<Utc>,
    },

    /// A peer connection was removed (closed, failed, or the peer left)
    PeerDisconnected {
        participant_id: ParticipantId,
        timestamp: DateTime<Utc>,
    },

    /// A peer connection's state changed
    ConnectionStateChanged {
        participant_id: ParticipantId,
        state: PeerConnectionState,
        timestamp: DateTime<Utc>,
    },

    /// The local participant started sharing their screen
    ScreenShareStarted { timestamp: DateTime<Utc> },

    /// The local participant stopped sharing their screen
    ScreenShareEnded { timestamp: DateTime<Utc> },

    RecordingStarted {
        mime_type: String,
        timestamp: DateTime<Utc>,
    },

    RecordingPaused { timestamp: DateTime<Utc> },

    RecordingResumed { timestamp: DateTime<Utc> },

    /// Recording finished; `data` is the complete output blob
    RecordingStopped {
        mime_type: String,
        data: Bytes,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Periodic per-peer stats snapshot
    Stats {
        participant_id: ParticipantId,
        stats: WebRtcStats,
        quality: NetworkQuality,
        timestamp: DateTime<Utc>,
    },

    /// A peer's derived network-quality grade changed
    QualityChanged {
        participant_id: ParticipantId,
        quality: NetworkQuality,
        timestamp: DateTime<Utc>,
    },

    /// A contained failure, tagged with the stable error code
    Error {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl CallEvent {
    /// Stable name of the event kind, used for logging
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamAdded { .. } => "stream_added",
            Self::StreamRemoved { .. } => "stream_removed",
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::ScreenShareStarted { .. } => "screen_share_started",
            Self::ScreenShareEnded { .. } => "screen_share_ended",
            Self::RecordingStarted { .. } => "recording_started",
            Self::RecordingPaused { .. } => "recording_paused",
            Self::RecordingResumed { .. } => "recording_resumed",
            Self::RecordingStopped { .. } => "recording_stopped",
            Self::Stats { .. } => "stats",
            Self::QualityChanged { .. } => "quality_changed",
            Self::Error { .. } => "error",
        }
    }

    /// Build an error event from an engine error
    #[must_use]
    pub fn from_error(err: &EngineError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }
}
